//! Transport to the coordination service's HTTP/JSON gateway.
//!
//! A transport performs exactly one call and classifies failures; it never
//! retries. Auth handling lives one level up in [`crate::Client`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::CoordError;

/// Default API version path segment.
pub const DEFAULT_VERSION: &str = "v3";

/// Default timeout for unary calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest stream document accepted before the stream is failed.
pub const MAX_LINE_SIZE: usize = 4 * 1024 * 1024;

/// A stream of JSON documents from a streaming call.
pub type JsonStream = Pin<Box<dyn Stream<Item = Result<Value, CoordError>> + Send>>;

/// One-shot access to the coordination service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a unary call and return the decoded response body.
    ///
    /// `uri` is relative to the gateway's versioned base, e.g. `kv/range`.
    async fn call(&self, uri: &str, body: &Value, token: Option<&str>)
        -> Result<Value, CoordError>;

    /// Open a streaming call and return its newline-delimited JSON documents.
    async fn open_stream(
        &self,
        uri: &str,
        body: &Value,
        token: Option<&str>,
    ) -> Result<JsonStream, CoordError>;
}

/// Normalize an endpoint and version into a base URL ending in `/`.
///
/// # Errors
///
/// Returns an error if the endpoint is empty.
pub fn base_url(endpoint: &str, version: &str) -> Result<String, CoordError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(CoordError::InvalidEndpoint("endpoint is empty".to_string()));
    }

    let server = if endpoint.starts_with("http") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };

    Ok(format!("{}/{}/", server, version.trim().trim_matches('/')))
}

/// Transport over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `endpoint` (e.g. `127.0.0.1:2379`) and API version.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is invalid or the HTTP client cannot be built.
    pub fn new(endpoint: &str, version: &str) -> Result<Self, CoordError> {
        // No client-wide timeout: watch streams stay open indefinitely.
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base: base_url(endpoint, version)?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the timeout applied to unary calls.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the base URL.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    fn post(
        &self,
        uri: &str,
        body: &Value,
        token: Option<&str>,
    ) -> Result<reqwest::RequestBuilder, CoordError> {
        let mut request = self.http.post(format!("{}{}", self.base, uri)).json(body);
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(token)
                .map_err(|e| CoordError::Decode(format!("invalid token header: {e}")))?;
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }
        Ok(request)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CoordError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "Gateway returned an error");
        Err(CoordError::from_response(status.as_u16(), body))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(
        &self,
        uri: &str,
        body: &Value,
        token: Option<&str>,
    ) -> Result<Value, CoordError> {
        trace!(uri, "Gateway call");
        let response = self.post(uri, body, token)?.timeout(self.timeout).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn open_stream(
        &self,
        uri: &str,
        body: &Value,
        token: Option<&str>,
    ) -> Result<JsonStream, CoordError> {
        trace!(uri, "Gateway stream");
        let response = self.post(uri, body, token)?.send().await?;
        let response = Self::check(response).await?;
        Ok(json_lines(response.bytes_stream()))
    }
}

/// Split a byte stream into newline-delimited JSON documents.
///
/// Blank lines are skipped; a trailing document without a final newline is
/// still yielded when the stream ends. A line longer than
/// [`MAX_LINE_SIZE`] yields a [`CoordError::Decode`] and ends the stream.
pub fn json_lines<S, E>(inner: S) -> JsonStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<CoordError>,
{
    json_lines_limited(inner, MAX_LINE_SIZE)
}

fn json_lines_limited<S, E>(inner: S, max_line: usize) -> JsonStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<CoordError>,
{
    let state = (Box::pin(inner), BytesMut::new(), false);
    Box::pin(futures_util::stream::unfold(
        state,
        move |(mut inner, mut buf, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    let line = &line[..pos];
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let item = serde_json::from_slice::<Value>(line).map_err(CoordError::from);
                    return Some((item, (inner, buf, false)));
                }

                if buf.len() > max_line {
                    let err = CoordError::Decode(format!("stream line exceeds {max_line} bytes"));
                    buf.clear();
                    return Some((Err(err), (inner, buf, true)));
                }

                match inner.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e.into()), (inner, buf, false))),
                    None => {
                        if buf.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        let rest = buf.split();
                        let item = serde_json::from_slice::<Value>(&rest).map_err(CoordError::from);
                        return Some((item, (inner, buf, false)));
                    }
                }
            }
        },
    ))
}
