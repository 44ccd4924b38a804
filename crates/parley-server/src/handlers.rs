//! Connection handlers for the Parley server.
//!
//! Each WebSocket connection gets a [`Session`] and an outbound queue. One
//! loop per connection multiplexes the queue (room messages and close
//! instructions from the session's subscription) with inbound requests.

use crate::config::{BrokerBackend, BrokerConfig, Config};
use crate::metrics::{self, ConnectionGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    outbound_queue, Broker, MemoryBroker, Outbound, RelayConfig, RoomRelay, Session,
};
use parley_protocol::{codes, decode_request, encode, Reply, METHOD_ROOM_JOIN};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The join relay.
    pub relay: RoomRelay,
    /// Server configuration.
    pub config: Config,
    next_connection: AtomicU64,
    active_connections: AtomicUsize,
}

impl AppState {
    /// Create new app state over `broker`.
    #[must_use]
    pub fn new(config: Config, broker: Arc<dyn Broker>) -> Self {
        let relay_config = RelayConfig {
            pool_size: config.broker.pool_size,
            broadcast_failure: config.relay.broadcast_failure,
        };

        Self {
            relay: RoomRelay::with_config(broker, relay_config),
            config,
            next_connection: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Get the number of open WebSocket connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn next_connection_id(&self) -> String {
        format!("conn_{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

/// Create the configured broker.
///
/// # Errors
///
/// Returns an error if the backend cannot be created.
pub fn build_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.backend {
        BrokerBackend::Memory => Ok(Arc::new(MemoryBroker::with_capacity(
            config.channel_capacity,
        ))),
        BrokerBackend::Redis => redis_broker(config),
    }
}

#[cfg(feature = "redis")]
fn redis_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    use anyhow::Context;

    let broker = parley_core::RedisBroker::open(&config.url)
        .with_context(|| format!("Invalid Redis URL: {}", config.url))?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis"))]
fn redis_broker(_config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    anyhow::bail!("Redis broker requested but parley was built without the `redis` feature")
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    config: Config,
    broker: Arc<dyn Broker>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::install(config.metrics.port) {
            error!("{:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(config, broker));
    let app = build_app(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    state.relay.pool().close();
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "broker": state.relay.broker().name(),
        "connections": state.active_connections(),
    }))
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Display name used in join notices.
    pub name: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.active_connections() >= state.config.limits.max_connections {
        warn!("Connection limit reached, rejecting upgrade");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, params))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let _guard = ConnectionGuard::new(&state.active_connections);

    let connection_id = state.next_connection_id();
    let name = params
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| connection_id.clone());

    debug!(connection = %connection_id, name = %name, "WebSocket connected");

    let (outbound_tx, mut outbound_rx) = outbound_queue();
    let mut session = Session::new(connection_id.clone(), name, outbound_tx);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Room traffic and close instructions from the subscription
            Some(outbound) = outbound_rx.recv() => match outbound {
                Outbound::Message(payload) => {
                    metrics::record_frame(payload.len(), "outbound");
                    let message = match String::from_utf8(payload.to_vec()) {
                        Ok(text) => Message::Text(text),
                        Err(e) => Message::Binary(e.into_bytes()),
                    };
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    info!(connection = %connection_id, "Room subscription lost, closing connection");
                    let frame = CloseFrame {
                        code: close_code::ERROR,
                        reason: "room subscription lost".into(),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            },

            // Receive from WebSocket
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            let reply = Reply::error("", None, codes::MALFORMED_REQUEST, "Frame is not UTF-8");
                            if send_reply(&mut sender, &reply).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                };

                metrics::record_frame(text.len(), "inbound");
                let reply = handle_request(&state, &mut session, &text).await;
                if send_reply(&mut sender, &reply).await.is_err() {
                    break;
                }
            }
        }
    }

    // Silent teardown; a subscription that already failed reports its own exit.
    if let Some(exit) = session.close().await {
        debug!(connection = %connection_id, exit = exit.as_str(), "Subscription released");
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode and dispatch one request frame.
async fn handle_request(state: &AppState, session: &mut Session, text: &str) -> Reply {
    let started = Instant::now();

    let request = match decode_request(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(connection = %session.id(), error = %e, "Malformed request");
            metrics::record_error("malformed_request");
            return Reply::error("", None, codes::MALFORMED_REQUEST, e.to_string());
        }
    };

    let reply = match request.method.as_str() {
        METHOD_ROOM_JOIN => match state.relay.join(session, request.param_str(0)).await {
            Ok(ack) => {
                metrics::record_join();
                Reply::result(METHOD_ROOM_JOIN, request.id, json!({ "message": ack.message }))
            }
            Err(e) => {
                let reason = if e.is_validation() { "validation" } else { "broadcast" };
                warn!(connection = %session.id(), error = %e, "Join failed");
                metrics::record_join_error(reason);
                Reply::error(METHOD_ROOM_JOIN, request.id, e.code(), e.to_string())
            }
        },
        other => {
            debug!(connection = %session.id(), method = %other, "Unknown method");
            metrics::record_error("method_not_found");
            Reply::error(
                other,
                request.id,
                codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )
        }
    };

    metrics::record_request(started.elapsed().as_secs_f64());
    reply
}

/// Send a reply to the WebSocket.
async fn send_reply(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    reply: &Reply,
) -> Result<()> {
    let text = encode(reply)?;
    metrics::record_frame(text.len(), "outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}
