//! Server configuration.
//!
//! Configuration is loaded from the first file found among
//! `parley.toml`, `/etc/parley/parley.toml` and `~/.config/parley/parley.toml`,
//! then overridden by `PARLEY__*` environment variables
//! (e.g. `PARLEY__PORT=9000`, `PARLEY__BROKER__URL=redis://cache:6379`).

use anyhow::{Context, Result};
use parley_core::BroadcastFailurePolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Candidate configuration files, in order of preference.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "PARLEY";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Message broker.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Join behaviour.
    #[serde(default)]
    pub relay: RelaySection,

    /// Coordination service and node registration.
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Broker backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process broker; rooms are local to this node.
    #[default]
    Memory,
    /// Redis pub/sub (requires the `redis` feature).
    Redis,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: BrokerBackend,

    /// Backend URL (Redis only).
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Maximum publishing connections in use at once.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Per-subscriber buffer of the memory backend.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySection {
    /// What to do when a join notice cannot be published.
    #[serde(default)]
    pub broadcast_failure: BroadcastFailurePolicy,
}

/// Coordination service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Gateway endpoint, e.g. `127.0.0.1:2379`.
    #[serde(default = "default_coord_endpoint")]
    pub endpoint: String,

    /// API version path segment.
    #[serde(default = "default_coord_version")]
    pub version: String,

    /// User name; authentication is skipped when unset.
    #[serde(default)]
    pub user: Option<String>,

    /// Password.
    #[serde(default)]
    pub password: Option<String>,

    /// Register this node on startup.
    #[serde(default)]
    pub register: bool,

    /// Service name nodes register under.
    #[serde(default = "default_service_name")]
    pub service: String,

    /// Node id; defaults to `{service}-{host}-{port}`.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Registration lease TTL in seconds.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: i64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    parley_core::pool::DEFAULT_POOL_SIZE
}

fn default_channel_capacity() -> usize {
    parley_core::memory::DEFAULT_CHANNEL_CAPACITY
}

fn default_coord_endpoint() -> String {
    "127.0.0.1:2379".to_string()
}

fn default_coord_version() -> String {
    parley_coord::transport::DEFAULT_VERSION.to_string()
}

fn default_service_name() -> String {
    "parley".to_string()
}

fn default_lease_ttl() -> i64 {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            broker: BrokerConfig::default(),
            relay: RelaySection::default(),
            coordination: CoordinationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: default_broker_url(),
            pool_size: default_pool_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_coord_endpoint(),
            version: default_coord_version(),
            user: None,
            password: None,
            register: false,
            service: default_service_name(),
            node_id: None,
            lease_ttl: default_lease_ttl(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first existing default path, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::build(path.as_deref())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .with_context(|| format!("Config path is not valid UTF-8: {}", path.display()))?;
        Self::build(Some(path))
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            tracing::debug!(path = %path, "Loading config file");
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Toml).required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let source = path.unwrap_or("defaults");
        builder
            .build()
            .with_context(|| format!("Failed to read config: {source}"))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse config: {source}"))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Get the id this node registers under.
    #[must_use]
    pub fn node_id(&self) -> String {
        self.coordination.node_id.clone().unwrap_or_else(|| {
            format!("{}-{}-{}", self.coordination.service, self.host, self.port)
        })
    }
}
