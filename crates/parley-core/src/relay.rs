//! Room join orchestration.
//!
//! [`RoomRelay::join`] moves a session into a room: it validates the id,
//! records it, silently tears down the previous subscription, subscribes
//! to the new room's channel, and announces the newcomer to the room.

use parley_protocol::codec::encode_bytes;
use parley_protocol::{MessageResult, Reply, METHOD_ROOM_MESSAGE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::RelayError;
use crate::pool::{ConnectionPool, DEFAULT_POOL_SIZE};
use crate::room::RoomId;
use crate::session::Session;
use crate::subscription::Subscription;

/// What a join does when its notice cannot be published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastFailurePolicy {
    /// Log the failure and acknowledge the join anyway.
    #[default]
    Report,
    /// Fail the join with [`RelayError::Broadcast`]. The session stays in
    /// the new room.
    Fail,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of publishing connections in use at once.
    pub pool_size: usize,
    /// Handling of join notice failures.
    pub broadcast_failure: BroadcastFailurePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            broadcast_failure: BroadcastFailurePolicy::default(),
        }
    }
}

/// Moves sessions between rooms.
#[derive(Debug, Clone)]
pub struct RoomRelay {
    broker: Arc<dyn Broker>,
    pool: ConnectionPool,
    config: RelayConfig,
}

impl RoomRelay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        info!(broker = broker.name(), config = ?config, "Creating room relay");
        let pool = ConnectionPool::new(Arc::clone(&broker), config.pool_size);
        Self {
            broker,
            pool,
            config,
        }
    }

    /// Get the broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Get the publishing pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Join `session` to the room named by `raw_room_id`.
    ///
    /// On success the session is subscribed to `room_{id}` and every message
    /// published there is forwarded to its outbound queue. Failures of the
    /// subscription itself are never returned here; they surface later as
    /// a close instruction on the outbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Validation`] if the id is missing or malformed,
    /// in which case the session is untouched. Returns
    /// [`RelayError::Broadcast`] if the join notice could not be published
    /// and the policy is [`BroadcastFailurePolicy::Fail`].
    pub async fn join(
        &self,
        session: &mut Session,
        raw_room_id: Option<&str>,
    ) -> Result<MessageResult, RelayError> {
        let room_id = RoomId::from_param(raw_room_id)?;

        session.set_room(room_id.clone());

        if let Some(previous) = session.take_subscription() {
            let channel = previous.channel().to_string();
            let exit = previous.shutdown().await;
            debug!(connection = %session.id(), channel = %channel, exit = ?exit, "Left previous room");
        }

        let channel = room_id.channel();
        let subscription =
            Subscription::start(Arc::clone(&self.broker), channel, session.outbound()).await;
        session.set_subscription(subscription);

        if let Err(e) = self.announce(session.name(), &room_id).await {
            match self.config.broadcast_failure {
                BroadcastFailurePolicy::Report => {
                    warn!(room = %room_id, error = %e, "Failed to announce join");
                }
                BroadcastFailurePolicy::Fail => return Err(e),
            }
        }

        info!(connection = %session.id(), room = %room_id, "Joined room");
        Ok(MessageResult::new(format!("I joined the room, id: {room_id}.")))
    }

    /// Publish the join notice for `name` to the room.
    async fn announce(&self, name: &str, room_id: &RoomId) -> Result<usize, RelayError> {
        let notice = Reply::notice(
            METHOD_ROOM_MESSAGE,
            json!({ "message": format!("{name} joined the room, id: {room_id}.") }),
        );
        let payload = encode_bytes(&notice)?;

        let mut conn = self.pool.acquire().await?;
        let recipients = conn.publish(&room_id.channel(), payload).await;
        conn.release();
        Ok(recipients?)
    }
}
