//! Coordination client errors.

use thiserror::Error;

/// Substrings the gateway uses when it rejects an auth token.
const AUTH_REJECTION_MARKERS: [&str; 2] = ["invalid auth token", "auth token is expired"];

/// Errors returned by the coordination client.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The server rejected the auth token (invalid or expired).
    #[error("Auth token rejected ({status}): {message}")]
    AuthExpired {
        /// HTTP status of the rejection.
        status: u16,
        /// Error text returned by the server.
        message: String,
    },

    /// A required entity (e.g. a lease) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Re-authentication was requested before any credentials were supplied.
    #[error("No credentials to re-authenticate with")]
    NoCredentials,

    /// The server answered with a non-success status.
    #[error("Request failed ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or error text.
        message: String,
    },

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A response field could not be decoded.
    #[error("Decoding error: {0}")]
    Decode(String),

    /// The endpoint could not be turned into a base URL.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl CoordError {
    /// Classify a failed response by its status and body.
    #[must_use]
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        if is_auth_rejection(&message) {
            Self::AuthExpired { status, message }
        } else {
            Self::Status { status, message }
        }
    }

    /// Check whether the server rejected the auth token.
    #[must_use]
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }

    /// Turn an auth rejection into a plain status error.
    ///
    /// Used once the re-authentication budget is spent.
    #[must_use]
    pub fn into_status(self) -> Self {
        match self {
            Self::AuthExpired { status, message } => Self::Status { status, message },
            other => other,
        }
    }
}

fn is_auth_rejection(message: &str) -> bool {
    AUTH_REJECTION_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}
