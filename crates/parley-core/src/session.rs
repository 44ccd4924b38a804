//! Per-connection session state.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::room::RoomId;
use crate::subscription::{Subscription, SubscriptionExit};

/// An instruction for the connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Deliver a payload to the client as-is.
    Message(Bytes),
    /// Close the client connection.
    Close,
}

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Create an outbound queue.
#[must_use]
pub fn outbound_queue() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// State of one client connection.
///
/// Holds the current room and at most one subscription. Only the relay
/// mutates it, and only through `&mut`, so joins on one session are
/// serialized.
#[derive(Debug)]
pub struct Session {
    id: String,
    name: String,
    room_id: Option<RoomId>,
    subscription: Option<Subscription>,
    outbound: OutboundSender,
}

impl Session {
    /// Create a session for a newly accepted connection.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, outbound: OutboundSender) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            room_id: None,
            subscription: None,
            outbound,
        }
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the display name used in join notices.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current room.
    #[must_use]
    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    /// Get the current subscription.
    #[must_use]
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Check if the session has a live subscription.
    #[must_use]
    pub fn has_active_subscription(&self) -> bool {
        self.subscription.as_ref().is_some_and(Subscription::is_active)
    }

    /// Get a sender for the outbound queue.
    #[must_use]
    pub fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    pub(crate) fn set_room(&mut self, room_id: RoomId) {
        self.room_id = Some(room_id);
    }

    pub(crate) fn take_subscription(&mut self) -> Option<Subscription> {
        self.subscription.take()
    }

    pub(crate) fn set_subscription(&mut self, subscription: Subscription) {
        self.subscription = Some(subscription);
    }

    /// Tear down the subscription silently; called when the connection closes.
    pub async fn close(&mut self) -> Option<SubscriptionExit> {
        let subscription = self.subscription.take()?;
        let exit = subscription.shutdown().await;
        debug!(connection = %self.id, exit = ?exit, "Session closed");
        Some(exit)
    }
}
