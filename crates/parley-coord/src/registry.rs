//! Service node registration.
//!
//! A node is stored as JSON under `{root}/{service}/{node_id}`, attached to a
//! lease so it disappears when its owner stops sending keepalives.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::Client;
use crate::error::CoordError;
use crate::kv::Lease;
use crate::watcher::{WatchEvent, Watcher};

/// Default key prefix for registered nodes.
pub const DEFAULT_ROOT: &str = "/parley/registry";

/// A service exposed by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
}

/// A running node and the services it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

impl ServiceNode {
    /// Create a node with no services.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            services: Vec::new(),
        }
    }

    /// Add an exposed service.
    #[must_use]
    pub fn with_service(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.services.push(ServiceEntry {
            id: id.into(),
            name: name.into(),
        });
        self
    }
}

/// Registers and discovers service nodes.
#[derive(Debug, Clone)]
pub struct Registry {
    client: Arc<Client>,
    root: String,
}

impl Registry {
    /// Create a registry under [`DEFAULT_ROOT`].
    #[must_use]
    pub fn new(client: Arc<Client>) -> Self {
        Self::with_root(client, DEFAULT_ROOT)
    }

    /// Create a registry under a custom key prefix.
    #[must_use]
    pub fn with_root(client: Arc<Client>, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    /// Get the underlying client.
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Key prefix holding every node of `service`.
    #[must_use]
    pub fn service_prefix(&self, service: &str) -> String {
        format!("{}/{}/", self.root, service)
    }

    /// Key of one node.
    #[must_use]
    pub fn node_key(&self, node: &ServiceNode) -> String {
        format!("{}{}", self.service_prefix(&node.name), node.id)
    }

    /// Grant a lease of `ttl` seconds and store the node under it.
    ///
    /// The caller keeps the registration alive with
    /// [`Client::keep_alive`] on the returned lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease cannot be granted or the node cannot be stored.
    pub async fn register(&self, node: &ServiceNode, ttl: i64) -> Result<Lease, CoordError> {
        let lease = self.client.grant(ttl).await?;
        let value = serde_json::to_string(node)?;
        self.client
            .put(&self.node_key(node), &value, Some(lease.id))
            .await?;
        info!(node = %node.id, service = %node.name, lease = lease.id, "Node registered");
        Ok(lease)
    }

    /// Remove a registration by revoking its lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the revoke call fails.
    pub async fn deregister(&self, node: &ServiceNode, lease: Lease) -> Result<(), CoordError> {
        self.client.revoke(lease.id).await?;
        info!(node = %node.id, service = %node.name, "Node deregistered");
        Ok(())
    }

    /// List the registered nodes of `service`.
    ///
    /// Entries that are not valid node JSON are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the range read fails.
    pub async fn nodes(&self, service: &str) -> Result<Vec<ServiceNode>, CoordError> {
        let kvs = self.client.get_prefix(&self.service_prefix(service)).await?;
        Ok(kvs
            .into_iter()
            .filter_map(|kv| match serde_json::from_slice(&kv.value) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(key = %kv.key_str(), error = %e, "Skipping malformed node entry");
                    None
                }
            })
            .collect())
    }

    /// Watch membership changes of `service`.
    pub fn watch_service<F>(&self, service: &str, callback: F) -> Watcher
    where
        F: FnMut(WatchEvent) + Send + 'static,
    {
        self.client
            .watch_keys_with_prefix(&self.service_prefix(service), callback)
    }
}
