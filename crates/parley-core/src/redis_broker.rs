//! Redis-backed broker.
//!
//! Each subscription opens its own pub/sub connection; publishing uses a
//! multiplexed connection.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use std::pin::Pin;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerConnection, BrokerError, MessageStream};

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_io_error() {
            BrokerError::ConnectionClosed
        } else {
            BrokerError::Backend(e.to_string())
        }
    }
}

/// Broker speaking to a Redis server.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    /// Create a broker for `url` (e.g. `redis://127.0.0.1:6379/0`).
    ///
    /// No connection is made until the first subscribe or connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn open(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn MessageStream>, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Subscribed on redis");

        Ok(Box::new(RedisStream {
            channel: channel.to_string(),
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }

    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Box::new(RedisConnection { conn, open: true }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RedisStream {
    channel: String,
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl MessageStream for RedisStream {
    async fn next_message(&mut self) -> Result<Bytes, BrokerError> {
        let msg = self
            .messages
            .next()
            .await
            .ok_or(BrokerError::ConnectionClosed)?;
        let payload: Vec<u8> = msg.get_payload()?;
        Ok(Bytes::from(payload))
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

struct RedisConnection {
    conn: redis::aio::MultiplexedConnection,
    open: bool,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<usize, BrokerError> {
        match self.conn.publish::<_, _, usize>(channel, payload.to_vec()).await {
            Ok(count) => Ok(count),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.open = false;
                }
                warn!(channel = %channel, error = %e, "Redis publish failed");
                Err(BrokerError::Publish(e.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
