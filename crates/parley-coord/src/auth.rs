//! Credential and token management.

use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::CoordError;
use crate::transport::Transport;

/// Gateway path of the authenticate RPC.
pub const URI_AUTHENTICATE: &str = "auth/authenticate";

#[derive(Clone)]
struct Credentials {
    user: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Holds the last-used credentials and at most one current token.
///
/// Tokens carry a server-side TTL (ten minutes by default on etcd); the
/// manager does not track it and relies on the server rejecting expired
/// tokens.
#[derive(Debug, Default)]
pub struct AuthManager {
    credentials: RwLock<Option<Credentials>>,
    token: RwLock<Option<String>>,
    refreshes: AtomicU64,
}

impl AuthManager {
    /// Create an unauthenticated manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate with `user` and `password`.
    ///
    /// The current token is discarded before anything else, and the
    /// credentials are remembered for [`AuthManager::refresh`]. Returns
    /// `true` when the server issued a token; any non-string token leaves the
    /// manager unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the authenticate call itself fails.
    pub async fn authenticate(
        &self,
        transport: &dyn Transport,
        user: &str,
        password: &str,
    ) -> Result<bool, CoordError> {
        *self.token.write().await = None;
        *self.credentials.write().await = Some(Credentials {
            user: user.to_string(),
            password: password.to_string(),
        });

        let body = json!({ "name": user, "password": password });
        let response = transport.call(URI_AUTHENTICATE, &body, None).await?;

        match response.get("token").and_then(Value::as_str) {
            Some(token) => {
                *self.token.write().await = Some(token.to_string());
                info!(user = %user, "Authenticated with coordination service");
                Ok(true)
            }
            None => {
                warn!(user = %user, "Authenticate response carried no token");
                Ok(false)
            }
        }
    }

    /// Authenticate again with the last-used credentials.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoCredentials`] if [`AuthManager::authenticate`]
    /// was never called, or the transport error of the authenticate call.
    pub async fn refresh(&self, transport: &dyn Transport) -> Result<bool, CoordError> {
        let credentials = self
            .credentials
            .read()
            .await
            .clone()
            .ok_or(CoordError::NoCredentials)?;

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(user = %credentials.user, "Refreshing auth token");
        self.authenticate(transport, &credentials.user, &credentials.password)
            .await
    }

    /// Get the current token.
    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Number of refreshes performed so far.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::JsonStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies to authenticate with a fixed body.
    struct FixedAuth {
        body: Value,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for FixedAuth {
        async fn call(
            &self,
            uri: &str,
            body: &Value,
            _token: Option<&str>,
        ) -> Result<Value, CoordError> {
            assert_eq!(uri, URI_AUTHENTICATE);
            self.seen.lock().unwrap().push(body.clone());
            Ok(self.body.clone())
        }

        async fn open_stream(
            &self,
            _uri: &str,
            _body: &Value,
            _token: Option<&str>,
        ) -> Result<JsonStream, CoordError> {
            unreachable!("authenticate never streams")
        }
    }

    fn transport(body: Value) -> FixedAuth {
        FixedAuth {
            body,
            seen: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_authenticate_stores_token() {
        let auth = AuthManager::new();
        let t = transport(json!({"header": {}, "token": "abc.123"}));

        assert!(auth.authenticate(&t, "root", "pw").await.unwrap());
        assert_eq!(auth.token().await.as_deref(), Some("abc.123"));
        assert_eq!(
            t.seen.lock().unwrap()[0],
            json!({"name": "root", "password": "pw"})
        );
    }

    #[tokio::test]
    async fn test_non_string_token_leaves_unauthenticated() {
        let auth = AuthManager::new();
        assert!(auth
            .authenticate(&transport(json!({"token": "first"})), "root", "pw")
            .await
            .unwrap());

        // A second call discards the old token even though no new one arrives.
        assert!(!auth
            .authenticate(&transport(json!({"token": 42})), "root", "pw")
            .await
            .unwrap());
        assert!(auth.token().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_reuses_credentials() {
        let auth = AuthManager::new();
        let t = transport(json!({"token": "t"}));

        assert!(matches!(
            auth.refresh(&t).await,
            Err(CoordError::NoCredentials)
        ));

        auth.authenticate(&t, "alice", "secret").await.unwrap();
        auth.refresh(&t).await.unwrap();
        assert_eq!(auth.refresh_count(), 1);

        let seen = t.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], json!({"name": "alice", "password": "secret"}));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            user: "alice".to_string(),
            password: "secret".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("secret"));
    }
}
