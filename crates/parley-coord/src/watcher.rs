//! Long-lived prefix watches.
//!
//! A [`Watcher`] opens one watch stream and hands every change event under
//! its prefix to a callback. It does not reconnect: when the stream ends the
//! run returns, and callers wanting to continue start a new watch, optionally
//! from [`Watcher::last_revision`] + 1.

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Client, URI_WATCH};
use crate::error::CoordError;
use crate::kv::{encode_bytes, prefix_range_end, KeyValue, RawKeyValue, ResponseHeader};

/// Callback invoked for every watch event.
pub type WatchCallback = Box<dyn FnMut(WatchEvent) + Send>;

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    #[default]
    Put,
    Delete,
}

/// A change to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

/// How a watch run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// The server closed the stream (or cancelled the watch on its side).
    Ended,
    /// The caller cancelled the watch.
    Cancelled,
}

#[derive(Debug, Default, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: EventKind,
    #[serde(default)]
    kv: RawKeyValue,
}

#[derive(Debug, Default, Deserialize)]
struct WatchResponse {
    #[serde(default)]
    header: ResponseHeader,
    #[serde(default)]
    created: bool,
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: String,
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchChunk {
    result: Option<WatchResponse>,
    error: Option<Value>,
}

/// A prefix watch bound to a client.
pub struct Watcher {
    client: Arc<Client>,
    prefix: String,
    callback: WatchCallback,
    start_revision: Option<i64>,
    last_revision: i64,
    cancel: CancellationToken,
}

impl Watcher {
    pub(crate) fn new(client: Arc<Client>, prefix: &str, callback: WatchCallback) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            callback,
            start_revision: None,
            last_revision: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Start from `revision` instead of the current one.
    #[must_use]
    pub fn from_revision(mut self, revision: i64) -> Self {
        self.start_revision = Some(revision);
        self
    }

    /// Get the watched prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Highest revision seen in a response header, 0 before the first one.
    #[must_use]
    pub fn last_revision(&self) -> i64 {
        self.last_revision
    }

    /// Token that stops [`Watcher::run`] when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the watch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Open the watch and deliver events until the stream terminates.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch cannot be opened, the stream fails, or
    /// the server reports an error in the stream. A rejected token is only
    /// refreshed while opening; an auth error reported inside an open stream
    /// comes back as [`CoordError::Status`].
    pub async fn run(&mut self) -> Result<WatchEnd, CoordError> {
        let cancel = self.cancel.clone();
        let mut create = json!({
            "key": encode_bytes(&self.prefix),
            "range_end": encode_bytes(prefix_range_end(&self.prefix)),
        });
        if let Some(revision) = self.start_revision {
            create["start_revision"] = json!(revision.to_string());
        }
        let request = json!({ "create_request": create });

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(WatchEnd::Cancelled),
            stream = self.client.open_stream(URI_WATCH, &request) => stream?,
        };
        info!(prefix = %self.prefix, "Watch started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(prefix = %self.prefix, "Watch cancelled");
                    return Ok(WatchEnd::Cancelled);
                }

                item = stream.next() => match item {
                    Some(Ok(chunk)) => {
                        if !self.dispatch(chunk)? {
                            return Ok(WatchEnd::Ended);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!(prefix = %self.prefix, "Watch stream ended");
                        return Ok(WatchEnd::Ended);
                    }
                },
            }
        }
    }

    /// Deliver one stream document. Returns `false` if the server cancelled the watch.
    fn dispatch(&mut self, chunk: Value) -> Result<bool, CoordError> {
        let chunk: WatchChunk = serde_json::from_value(chunk)?;

        if let Some(error) = chunk.error {
            let status = error
                .get("http_code")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok())
                .unwrap_or(500);
            // An open stream is never re-authenticated; callers restart the watch.
            return Err(CoordError::from_response(status, error.to_string()).into_status());
        }

        let Some(response) = chunk.result else {
            return Ok(true);
        };

        self.last_revision = self.last_revision.max(response.header.revision);

        if response.created {
            debug!(prefix = %self.prefix, revision = response.header.revision, "Watch created");
        }

        for raw in response.events {
            let event = WatchEvent {
                kind: raw.kind,
                kv: KeyValue::try_from(raw.kv)?,
            };
            (self.callback)(event);
        }

        if response.canceled {
            warn!(prefix = %self.prefix, reason = %response.cancel_reason, "Watch cancelled by server");
            return Ok(false);
        }

        Ok(true)
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("prefix", &self.prefix)
            .field("start_revision", &self.start_revision)
            .field("last_revision", &self.last_revision)
            .finish()
    }
}
