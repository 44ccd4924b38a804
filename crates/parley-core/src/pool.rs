//! Pool of publishing connections.
//!
//! A [`PooledConnection`] is returned to the pool when it is dropped, so a
//! connection borrowed for one publish goes back whether the publish
//! succeeded or failed. Connections that report themselves closed are
//! discarded instead of being reused.

use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::broker::{Broker, BrokerConnection, BrokerError};

/// Default maximum number of connections handed out at once.
pub const DEFAULT_POOL_SIZE: usize = 16;

struct PoolInner {
    broker: Arc<dyn Broker>,
    idle: Mutex<Vec<Box<dyn BrokerConnection>>>,
    permits: Arc<Semaphore>,
    max_size: usize,
}

/// A bounded pool of broker connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool handing out at most `max_size` connections at once.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                broker,
                idle: Mutex::new(Vec::with_capacity(max_size)),
                permits: Arc::new(Semaphore::new(max_size)),
                max_size,
            }),
        }
    }

    /// Borrow a connection, waiting if all are in use.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is closed or a new connection cannot be opened.
    pub async fn acquire(&self) -> Result<PooledConnection, BrokerError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::PoolClosed)?;

        let reused = {
            let mut idle = self.inner.idle();
            let mut found = None;
            while let Some(conn) = idle.pop() {
                if conn.is_open() {
                    found = Some(conn);
                    break;
                }
                debug!("Discarding closed pooled connection");
            }
            found
        };

        let conn = match reused {
            Some(conn) => {
                trace!("Reusing pooled connection");
                conn
            }
            None => {
                debug!(broker = self.inner.broker.name(), "Opening pooled connection");
                self.inner.broker.connect().await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Stop handing out connections. Waiting and future acquires fail.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle().clear();
    }

    /// Get the maximum number of connections handed out at once.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Get the number of idle connections.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    /// Get the number of connections that can be acquired without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

impl PoolInner {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn BrokerConnection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("broker", &self.inner.broker.name())
            .field("max_size", &self.inner.max_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A connection borrowed from a [`ConnectionPool`].
pub struct PooledConnection {
    conn: Option<Box<dyn BrokerConnection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Publish `payload` to `channel`.
    ///
    /// # Errors
    ///
    /// Returns the broker error if publishing fails.
    pub async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<usize, BrokerError> {
        match self.conn.as_mut() {
            Some(conn) => conn.publish(channel, payload).await,
            None => Err(BrokerError::ConnectionClosed),
        }
    }

    /// Return the connection to the pool now.
    pub fn release(self) {}
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !conn.is_open() || self.pool.permits.is_closed() {
            debug!("Dropping closed connection instead of returning it");
            return;
        }
        let mut idle = self.pool.idle();
        if idle.len() < self.pool.max_size {
            idle.push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageStream;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts connects; publishes fail on demand.
    struct CountingBroker {
        inner: MemoryBroker,
        connects: AtomicUsize,
        fail_publish: bool,
    }

    struct FlakyConnection {
        inner: Box<dyn BrokerConnection>,
        fail: bool,
    }

    #[async_trait]
    impl BrokerConnection for FlakyConnection {
        async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<usize, BrokerError> {
            if self.fail {
                return Err(BrokerError::Publish("refused".to_string()));
            }
            self.inner.publish(channel, payload).await
        }
    }

    #[async_trait]
    impl Broker for CountingBroker {
        async fn subscribe(&self, channel: &str) -> Result<Box<dyn MessageStream>, BrokerError> {
            self.inner.subscribe(channel).await
        }

        async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyConnection {
                inner: self.inner.connect().await?,
                fail: self.fail_publish,
            }))
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn counting(fail_publish: bool) -> Arc<CountingBroker> {
        Arc::new(CountingBroker {
            inner: MemoryBroker::new(),
            connects: AtomicUsize::new(0),
            fail_publish,
        })
    }

    #[tokio::test]
    async fn test_connection_reused_after_release() {
        let broker = counting(false);
        let pool = ConnectionPool::new(broker.clone(), 2);

        let mut conn = pool.acquire().await.unwrap();
        conn.publish("room_1", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(pool.available(), 1);
        conn.release();

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.idle_count(), 1);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(broker.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_released_after_failed_publish() {
        let pool = ConnectionPool::new(counting(true), 1);

        {
            let mut conn = pool.acquire().await.unwrap();
            assert!(conn.publish("room_1", Bytes::new()).await.is_err());
        }

        assert_eq!(pool.available(), 1);
        // The single slot is free again, so this does not wait.
        let acquired = tokio::time::timeout(Duration::from_secs(1), pool.acquire()).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_when_exhausted() {
        let pool = ConnectionPool::new(counting(false), 1);
        let held = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err());

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = ConnectionPool::new(counting(false), 1);
        pool.close();
        assert!(matches!(
            pool.acquire().await,
            Err(BrokerError::PoolClosed)
        ));
    }
}
