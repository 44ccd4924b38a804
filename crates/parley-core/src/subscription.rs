//! Room subscriptions.
//!
//! A subscription is a task that owns one broker stream and forwards every
//! message into a connection's outbound queue. It is stopped by setting its
//! `disabled` flag and then cancelling the token that guards the stream;
//! the task sees the forced termination as a transport error and, because
//! the flag is set, exits without asking the connection to close.
//!
//! The flag and token are captured by the task at spawn time, so the exit
//! path always consults the instance it belongs to, never whatever the
//! session holds by then.

use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerError};
use crate::session::{Outbound, OutboundSender};

/// Counter of finished subscriptions, labelled by `outcome`.
pub const SUBSCRIPTION_EXITS_TOTAL: &str = "parley_subscription_exits_total";

/// How a subscription task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionExit {
    /// Stopped after being disabled; nothing was signalled.
    Silent,
    /// Failed while live; a close instruction was queued.
    CloseSignaled,
    /// The outbound queue was gone, so there was nobody to notify.
    Detached,
    /// The task panicked or was aborted.
    Aborted,
}

impl SubscriptionExit {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Silent => "silent",
            Self::CloseSignaled => "signaled",
            Self::Detached => "detached",
            Self::Aborted => "aborted",
        }
    }
}

/// Handle to a running subscription task.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    disabled: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<SubscriptionExit>,
}

impl Subscription {
    /// Subscribe to `channel` on a fresh broker connection and start forwarding.
    ///
    /// Returns once the broker has confirmed the subscription or the attempt
    /// has failed; a failure is handled by the task like any other transport
    /// error and is not returned here.
    pub async fn start(broker: Arc<dyn Broker>, channel: String, outbound: OutboundSender) -> Self {
        let disabled = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(run(
            broker,
            channel.clone(),
            outbound,
            Arc::clone(&disabled),
            cancel.clone(),
            ready_tx,
        ));

        // Err means the task ended before subscribing; it has already reported.
        let _ = ready_rx.await;

        Self {
            channel,
            disabled,
            cancel,
            task,
        }
    }

    /// Get the subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Check if the subscription was disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Check if the subscription is live: not disabled and still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_disabled() && !self.task.is_finished()
    }

    /// Mark the subscription as intentionally discarded, then terminate its connection.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Disable the subscription and wait for its task to finish.
    pub async fn shutdown(self) -> SubscriptionExit {
        self.disable();
        self.join().await
    }

    /// Wait for the task to finish without disabling it.
    pub async fn join(self) -> SubscriptionExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(channel = %self.channel, error = %e, "Subscription task failed");
                SubscriptionExit::Aborted
            }
        }
    }
}

async fn run(
    broker: Arc<dyn Broker>,
    channel: String,
    outbound: OutboundSender,
    disabled: Arc<AtomicBool>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) -> SubscriptionExit {
    let exit = supervise(broker, channel, outbound, disabled, cancel, ready).await;
    counter!(SUBSCRIPTION_EXITS_TOTAL, "outcome" => exit.as_str()).increment(1);
    exit
}

async fn supervise(
    broker: Arc<dyn Broker>,
    channel: String,
    outbound: OutboundSender,
    disabled: Arc<AtomicBool>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) -> SubscriptionExit {
    let err = match forward(broker.as_ref(), &channel, &outbound, &cancel, ready).await {
        Ok(()) => {
            debug!(channel = %channel, "Outbound queue closed, subscription detached");
            return SubscriptionExit::Detached;
        }
        Err(e) => e,
    };

    if disabled.load(Ordering::SeqCst) {
        debug!(channel = %channel, "Subscription disabled, exiting quietly");
        return SubscriptionExit::Silent;
    }

    warn!(channel = %channel, error = %err, "Subscription failed, closing connection");
    if outbound.send(Outbound::Close).is_err() {
        return SubscriptionExit::Detached;
    }
    SubscriptionExit::CloseSignaled
}

/// Forward messages until the stream fails or the outbound queue is gone.
///
/// Returns `Ok(())` only when the outbound queue was closed.
async fn forward(
    broker: &dyn Broker,
    channel: &str,
    outbound: &OutboundSender,
    cancel: &CancellationToken,
    ready: oneshot::Sender<()>,
) -> Result<(), BrokerError> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(BrokerError::ConnectionClosed),
        stream = broker.subscribe(channel) => stream?,
    };
    let _ = ready.send(());

    loop {
        let payload = tokio::select! {
            biased;
            // Dropping the stream on return closes its connection.
            _ = cancel.cancelled() => return Err(BrokerError::ConnectionClosed),
            payload = stream.next_message() => payload?,
        };

        if outbound.send(Outbound::Message(payload)).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnection, MessageStream};
    use crate::memory::MemoryBroker;
    use crate::session::outbound_queue;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Every subscribe attempt fails.
    struct UnreachableBroker;

    #[async_trait]
    impl Broker for UnreachableBroker {
        async fn subscribe(&self, _channel: &str) -> Result<Box<dyn MessageStream>, BrokerError> {
            Err(BrokerError::Connect("unreachable".to_string()))
        }

        async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            Err(BrokerError::Connect("unreachable".to_string()))
        }

        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    #[tokio::test]
    async fn test_listening_when_started() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = outbound_queue();

        let sub = Subscription::start(Arc::new(broker.clone()), "room_1".to_string(), tx).await;

        assert_eq!(sub.channel(), "room_1");
        assert!(sub.is_active());
        assert_eq!(broker.subscriber_count("room_1"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_silent() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = outbound_queue();
        let sub = Subscription::start(Arc::new(broker.clone()), "room_1".to_string(), tx).await;

        assert_eq!(sub.shutdown().await, SubscriptionExit::Silent);
        assert!(rx.try_recv().is_err());
        assert!(!broker.channel_exists("room_1"));
    }

    #[tokio::test]
    async fn test_failed_subscribe_signals_close() {
        let (tx, mut rx) = outbound_queue();
        let sub = Subscription::start(Arc::new(UnreachableBroker), "room_1".to_string(), tx).await;

        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(sub.join().await, SubscriptionExit::CloseSignaled);
    }

    #[tokio::test]
    async fn test_detached_when_queue_dropped() {
        let broker = MemoryBroker::new();
        let (tx, rx) = outbound_queue();
        let sub = Subscription::start(Arc::new(broker.clone()), "room_1".to_string(), tx).await;
        drop(rx);

        let mut conn = broker.connect().await.unwrap();
        conn.publish("room_1", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(sub.join().await, SubscriptionExit::Detached);
    }
}
