//! In-process broker.
//!
//! Channels are `tokio::sync::broadcast` senders indexed by name. A channel
//! is created by its first subscriber and deleted when the last one leaves.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::broker::{Broker, BrokerConnection, BrokerError, MessageStream};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

type Channels = Arc<DashMap<String, broadcast::Sender<Bytes>>>;

/// Broker that keeps all channels in memory.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    channels: Channels,
    capacity: usize,
}

impl MemoryBroker {
    /// Create a broker with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a broker whose channels buffer up to `capacity` messages per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Get the number of live subscriptions on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Get the number of live subscriptions across all channels.
    #[must_use]
    pub fn total_subscribers(&self) -> usize {
        self.channels.iter().map(|e| e.value().receiver_count()).sum()
    }

    /// Get all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop a channel, failing every subscription on it.
    ///
    /// Returns `true` if the channel existed.
    pub fn close_channel(&self, channel: &str) -> bool {
        let removed = self.channels.remove(channel).is_some();
        if removed {
            debug!(channel = %channel, "Channel closed");
        }
        removed
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn MessageStream>, BrokerError> {
        validate_channel_name(channel).map_err(BrokerError::InvalidChannel)?;

        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating new channel");
                broadcast::channel(self.capacity).0
            })
            .subscribe();

        debug!(channel = %channel, "Subscribed");
        Ok(Box::new(MemoryStream {
            channel: channel.to_string(),
            rx: Some(rx),
            channels: Arc::clone(&self.channels),
        }))
    }

    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        Ok(Box::new(MemoryConnection {
            channels: Arc::clone(&self.channels),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Subscription to one in-memory channel.
struct MemoryStream {
    channel: String,
    rx: Option<broadcast::Receiver<Bytes>>,
    channels: Channels,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn next_message(&mut self) -> Result<Bytes, BrokerError> {
        let rx = self.rx.as_mut().ok_or(BrokerError::ConnectionClosed)?;
        loop {
            match rx.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BrokerError::ConnectionClosed);
                }
            }
        }
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        // Release the receiver before checking for remaining subscribers.
        drop(self.rx.take());
        let removed = self
            .channels
            .remove_if(&self.channel, |_, tx| tx.receiver_count() == 0)
            .is_some();
        if removed {
            debug!(channel = %self.channel, "Deleted empty channel");
        }
    }
}

/// Publishing handle for the in-memory broker.
struct MemoryConnection {
    channels: Channels,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<usize, BrokerError> {
        validate_channel_name(channel).map_err(BrokerError::InvalidChannel)?;

        let count = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or_default(),
            None => 0,
        };
        trace!(channel = %channel, recipients = count, "Published message");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("room_1").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("room\n").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let broker = MemoryBroker::new();
        let mut s1 = broker.subscribe("room_1").await.unwrap();
        let mut s2 = broker.subscribe("room_1").await.unwrap();
        assert_eq!(broker.subscriber_count("room_1"), 2);

        let mut conn = broker.connect().await.unwrap();
        let count = conn
            .publish("room_1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(count, 2);

        assert_eq!(&s1.next_message().await.unwrap()[..], b"hello");
        assert_eq!(&s2.next_message().await.unwrap()[..], b"hello");
        assert_eq!(s1.channel(), "room_1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect().await.unwrap();
        assert_eq!(conn.publish("room_x", Bytes::new()).await.unwrap(), 0);
        assert!(!broker.channel_exists("room_x"));
    }

    #[tokio::test]
    async fn test_empty_channel_deleted_on_drop() {
        let broker = MemoryBroker::new();
        let s1 = broker.subscribe("room_1").await.unwrap();
        let s2 = broker.subscribe("room_1").await.unwrap();

        drop(s1);
        assert!(broker.channel_exists("room_1"));
        drop(s2);
        assert!(!broker.channel_exists("room_1"));
    }

    #[tokio::test]
    async fn test_close_channel_fails_subscribers() {
        let broker = MemoryBroker::new();
        let mut stream = broker.subscribe("room_1").await.unwrap();

        assert!(broker.close_channel("room_1"));
        assert!(matches!(
            stream.next_message().await,
            Err(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.subscribe("").await,
            Err(BrokerError::InvalidChannel(_))
        ));
    }
}
