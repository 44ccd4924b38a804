//! Coordination client with transparent token refresh.

use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::AuthManager;
use crate::error::CoordError;
use crate::kv::{
    self, encode_bytes, KeyValue, Lease, RangeOptions, RangeResponse, RawLease,
};
use crate::transport::{HttpTransport, JsonStream, Transport, DEFAULT_VERSION};
use crate::watcher::{WatchEvent, Watcher};

pub const URI_RANGE: &str = "kv/range";
pub const URI_PUT: &str = "kv/put";
pub const URI_DELETE_RANGE: &str = "kv/deleterange";
pub const URI_LEASE_GRANT: &str = "lease/grant";
pub const URI_LEASE_REVOKE: &str = "lease/revoke";
pub const URI_KEEPALIVE: &str = "lease/keepalive";
pub const URI_WATCH: &str = "watch";

/// Re-authentications allowed per call after an auth rejection.
const AUTH_RETRY_BUDGET: u32 = 1;

#[derive(Serialize)]
struct RangeRequest<'a> {
    key: String,
    #[serde(flatten)]
    options: &'a RangeOptions,
}

/// Client for the coordination service.
///
/// Every RPC goes through one retry discipline: when the server rejects the
/// auth token, the client re-authenticates once with the last-used
/// credentials and repeats the call once. A second rejection, or any other
/// failure, is returned to the caller.
pub struct Client {
    transport: Arc<dyn Transport>,
    auth: AuthManager,
}

impl Client {
    /// Connect to `endpoint` using the default API version.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is invalid.
    pub fn connect(endpoint: &str) -> Result<Self, CoordError> {
        Self::connect_with_version(endpoint, DEFAULT_VERSION)
    }

    /// Connect to `endpoint` using a specific API version path (e.g. `v3beta`).
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is invalid.
    pub fn connect_with_version(endpoint: &str, version: &str) -> Result<Self, CoordError> {
        Ok(Self::with_transport(Arc::new(HttpTransport::new(
            endpoint, version,
        )?)))
    }

    /// Create a client over an existing transport.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            auth: AuthManager::new(),
        }
    }

    /// Authenticate, replacing any current token.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the authenticate call fails.
    pub async fn auth(&self, user: &str, password: &str) -> Result<(), CoordError> {
        self.auth
            .authenticate(self.transport.as_ref(), user, password)
            .await
            .map(|_| ())
    }

    /// Authenticate again with the last-used credentials.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoCredentials`] if [`Client::auth`] was never called.
    pub async fn refresh_auth(&self) -> Result<(), CoordError> {
        self.auth
            .refresh(self.transport.as_ref())
            .await
            .map(|_| ())
    }

    /// Get the current auth token.
    pub async fn token(&self) -> Option<String> {
        self.auth.token().await
    }

    /// Number of re-authentications triggered by token rejections.
    #[must_use]
    pub fn reauth_count(&self) -> u64 {
        self.auth.refresh_count()
    }

    /// Read a key or a range of keys.
    ///
    /// Returns an empty list when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or a key/value cannot be decoded.
    pub async fn get(&self, key: &str, options: RangeOptions) -> Result<Vec<KeyValue>, CoordError> {
        let response = self.range(key, &options).await?;
        response.kvs.into_iter().map(KeyValue::try_from).collect()
    }

    /// Read every key under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordError> {
        self.get(prefix, RangeOptions::prefix(prefix)).await
    }

    /// Count the keys a range read would return.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn count(&self, key: &str, options: RangeOptions) -> Result<i64, CoordError> {
        Ok(self.range(key, &options.count_only()).await?.count)
    }

    async fn range(&self, key: &str, options: &RangeOptions) -> Result<RangeResponse, CoordError> {
        let params = serde_json::to_value(RangeRequest {
            key: encode_bytes(key),
            options,
        })?;
        let body = self.request(URI_RANGE, &params).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Store `value` under `key`, optionally bound to a lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn put(&self, key: &str, value: &str, lease: Option<i64>) -> Result<(), CoordError> {
        let mut params = json!({
            "key": encode_bytes(key),
            "value": encode_bytes(value),
        });
        if let Some(lease) = lease {
            params["lease"] = json!(lease.to_string());
        }
        self.request(URI_PUT, &params).await?;
        Ok(())
    }

    /// Delete a single key. Returns the number of deleted keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn delete(&self, key: &str) -> Result<i64, CoordError> {
        self.delete_range(json!({ "key": encode_bytes(key) })).await
    }

    /// Delete every key under `prefix`. Returns the number of deleted keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<i64, CoordError> {
        self.delete_range(json!({
            "key": encode_bytes(prefix),
            "range_end": encode_bytes(kv::prefix_range_end(prefix)),
        }))
        .await
    }

    async fn delete_range(&self, params: Value) -> Result<i64, CoordError> {
        #[derive(serde::Deserialize)]
        struct DeleteResponse {
            #[serde(default, deserialize_with = "kv::int64")]
            deleted: i64,
        }

        let body = self.request(URI_DELETE_RANGE, &params).await?;
        let response: DeleteResponse = serde_json::from_value(body)?;
        Ok(response.deleted)
    }

    /// Grant a lease with `ttl` seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the response lacks the lease.
    pub async fn grant(&self, ttl: i64) -> Result<Lease, CoordError> {
        let body = self
            .request(URI_LEASE_GRANT, &json!({ "TTL": ttl.to_string() }))
            .await?;
        let raw: RawLease = serde_json::from_value(body)?;
        raw.complete()
            .ok_or_else(|| CoordError::Decode("grant response lacks ID or TTL".to_string()))
    }

    /// Revoke a lease, deleting every key attached to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn revoke(&self, id: i64) -> Result<(), CoordError> {
        self.request(URI_LEASE_REVOKE, &json!({ "ID": id.to_string() }))
            .await?;
        Ok(())
    }

    /// Send one keepalive for a lease and return its refreshed TTL.
    ///
    /// This is a single request; callers keep a lease alive by calling it
    /// at an interval shorter than the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NotFound`] if the response does not carry both the
    /// lease id and TTL (the lease is unknown or expired).
    pub async fn keep_alive(&self, id: i64) -> Result<Lease, CoordError> {
        #[derive(serde::Deserialize)]
        struct KeepAliveResponse {
            result: Option<RawLease>,
        }

        let body = self
            .request(URI_KEEPALIVE, &json!({ "ID": id.to_string() }))
            .await?;
        let response: KeepAliveResponse = serde_json::from_value(body)?;

        response
            .result
            .as_ref()
            .and_then(RawLease::complete)
            .ok_or_else(|| {
                warn!(lease = id, "Keepalive for unknown lease");
                CoordError::NotFound(format!("Invalid lease id {id}"))
            })
    }

    /// Create a watcher for every key under `prefix`.
    ///
    /// Nothing is sent until [`Watcher::run`] is awaited.
    pub fn watch_keys_with_prefix<F>(self: &Arc<Self>, prefix: &str, callback: F) -> Watcher
    where
        F: FnMut(WatchEvent) + Send + 'static,
    {
        Watcher::new(Arc::clone(self), prefix, Box::new(callback))
    }

    /// Issue a unary call with the auth retry discipline.
    pub(crate) async fn request(&self, uri: &str, params: &Value) -> Result<Value, CoordError> {
        let transport = self.transport.as_ref();
        self.with_auth_retry(uri, |token| async move {
            transport.call(uri, params, token.as_deref()).await
        })
        .await
    }

    /// Open a streaming call with the auth retry discipline.
    pub(crate) async fn open_stream(
        &self,
        uri: &str,
        params: &Value,
    ) -> Result<JsonStream, CoordError> {
        let transport = self.transport.as_ref();
        self.with_auth_retry(uri, |token| async move {
            transport.open_stream(uri, params, token.as_deref()).await
        })
        .await
    }

    async fn with_auth_retry<T, F, Fut>(&self, uri: &str, mut call: F) -> Result<T, CoordError>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        let mut retries_left = AUTH_RETRY_BUDGET;
        loop {
            match call(self.auth.token().await).await {
                Err(err) if err.is_auth_expired() => {
                    if retries_left == 0 {
                        warn!(uri, "Auth token rejected after refresh");
                        return Err(err.into_status());
                    }
                    retries_left -= 1;
                    debug!(uri, "Auth token rejected, re-authenticating");
                    self.refresh_auth().await?;
                }
                result => return result,
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("auth", &self.auth).finish()
    }
}
