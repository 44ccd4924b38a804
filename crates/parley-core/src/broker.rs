//! Message broker abstraction.
//!
//! A broker offers two kinds of connections: a dedicated subscriber stream
//! per channel, and general-purpose connections used for publishing (these
//! are the ones kept in a [`crate::ConnectionPool`]).

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The connection was closed (by either side).
    #[error("Broker connection closed")]
    ConnectionClosed,

    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Could not open a connection.
    #[error("Broker connect failed: {0}")]
    Connect(String),

    /// Publishing failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The connection pool was shut down.
    #[error("Connection pool closed")]
    PoolClosed,

    /// Backend-specific failure.
    #[error("Broker error: {0}")]
    Backend(String),
}

/// A message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a fresh connection subscribed to `channel`.
    ///
    /// Dropping the returned stream closes the connection.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn MessageStream>, BrokerError>;

    /// Open a fresh publishing connection.
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;

    /// Get the broker name (e.g. "memory", "redis").
    fn name(&self) -> &'static str;
}

/// Inbound messages of one subscription.
#[async_trait]
pub trait MessageStream: Send {
    /// Wait for the next message.
    ///
    /// Every failure, including the connection being closed, is an error;
    /// the stream is unusable afterwards.
    async fn next_message(&mut self) -> Result<Bytes, BrokerError>;

    /// Get the subscribed channel.
    fn channel(&self) -> &str;
}

/// A publishing connection.
#[async_trait]
pub trait BrokerConnection: Send {
    /// Publish `payload` to `channel`.
    ///
    /// Returns the number of subscribers that received it.
    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<usize, BrokerError>;

    /// Check if the connection can still be used.
    fn is_open(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Broker").field(&self.name()).finish()
    }
}
