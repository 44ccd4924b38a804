//! Node registration with the coordination service.
//!
//! The node is stored under a lease and kept alive by a background task
//! that sends a keepalive every third of the lease TTL. When the lease is
//! gone (the server answers without a TTL) the node is registered again.

use anyhow::{Context, Result};
use parley_coord::{Client, CoordError, EventKind, Lease, Registry, ServiceNode};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CoordinationConfig, Config};

/// A live registration; dropping it without [`Registration::shutdown`]
/// leaves the lease to expire on its own.
pub struct Registration {
    registry: Registry,
    node: ServiceNode,
    cancel: CancellationToken,
    keepalive: JoinHandle<Lease>,
    membership: JoinHandle<()>,
}

/// Interval between keepalives for a lease of `ttl` seconds.
pub fn keepalive_interval(ttl: i64) -> Duration {
    let secs = u64::try_from(ttl / 3).unwrap_or(0).max(1);
    Duration::from_secs(secs)
}

/// Connect to the coordination service and authenticate if credentials are set.
///
/// # Errors
///
/// Returns an error if the endpoint is invalid or authentication fails.
pub async fn connect(config: &CoordinationConfig) -> Result<Arc<Client>> {
    let client = Client::connect_with_version(&config.endpoint, &config.version)
        .with_context(|| format!("Invalid coordination endpoint: {}", config.endpoint))?;

    if let Some(user) = &config.user {
        let password = config.password.as_deref().unwrap_or_default();
        client
            .auth(user, password)
            .await
            .context("Coordination authentication failed")?;
        debug!(user = %user, "Authenticated with coordination service");
    }

    Ok(Arc::new(client))
}

impl Registration {
    /// Register this node and start its keepalive and membership tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be registered.
    pub async fn start(client: Arc<Client>, config: &Config) -> Result<Self> {
        let coordination = &config.coordination;
        let registry = Registry::new(client);
        let node = ServiceNode::new(
            config.node_id(),
            coordination.service.clone(),
            format!("{}:{}", config.host, config.port),
        )
        .with_service("websocket", config.transport.websocket_path.clone());

        let lease = registry
            .register(&node, coordination.lease_ttl)
            .await
            .context("Failed to register node")?;

        let cancel = CancellationToken::new();
        let keepalive = tokio::spawn(keep_alive(
            registry.clone(),
            node.clone(),
            lease,
            coordination.lease_ttl,
            cancel.clone(),
        ));
        let membership = tokio::spawn(watch_membership(
            registry.clone(),
            coordination.service.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            registry,
            node,
            cancel,
            keepalive,
            membership,
        })
    }

    /// Get the registered node.
    #[must_use]
    pub fn node(&self) -> &ServiceNode {
        &self.node
    }

    /// Stop the background tasks and revoke the lease.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.membership.await;
        match self.keepalive.await {
            Ok(lease) => {
                if let Err(e) = self.registry.deregister(&self.node, lease).await {
                    warn!(node = %self.node.id, error = %e, "Failed to deregister node");
                }
            }
            Err(e) => error!(error = %e, "Keepalive task failed"),
        }
    }
}

/// Keep `lease` alive until cancelled; returns the lease held at that point.
async fn keep_alive(
    registry: Registry,
    node: ServiceNode,
    mut lease: Lease,
    ttl: i64,
    cancel: CancellationToken,
) -> Lease {
    let mut interval = tokio::time::interval(keepalive_interval(ttl));
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return lease,
            _ = interval.tick() => {}
        }

        match registry.client().keep_alive(lease.id).await {
            Ok(renewed) => {
                debug!(lease = renewed.id, ttl = renewed.ttl, "Lease renewed");
                lease = renewed;
            }
            Err(CoordError::NotFound(_)) => {
                warn!(lease = lease.id, "Lease expired, registering again");
                match registry.register(&node, ttl).await {
                    Ok(fresh) => lease = fresh,
                    Err(e) => warn!(error = %e, "Failed to register node again"),
                }
            }
            Err(e) => warn!(lease = lease.id, error = %e, "Lease keepalive failed"),
        }
    }
}

/// Log nodes joining and leaving the service until cancelled or the watch ends.
async fn watch_membership(registry: Registry, service: String, cancel: CancellationToken) {
    let mut watcher = registry.watch_service(&service, |event| match event.kind {
        EventKind::Put => info!(key = %event.kv.key_str(), "Service node up"),
        EventKind::Delete => info!(key = %event.kv.key_str(), "Service node down"),
    });

    tokio::select! {
        result = watcher.run() => match result {
            Ok(end) => debug!(service = %service, end = ?end, "Membership watch finished"),
            Err(e) => warn!(service = %service, error = %e, "Membership watch failed"),
        },
        _ = cancel.cancelled() => debug!(service = %service, "Membership watch stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_interval() {
        assert_eq!(keepalive_interval(30), Duration::from_secs(10));
        assert_eq!(keepalive_interval(10), Duration::from_secs(3));
        // Never spin on tiny or bogus TTLs.
        assert_eq!(keepalive_interval(2), Duration::from_secs(1));
        assert_eq!(keepalive_interval(-5), Duration::from_secs(1));
    }
}
