//! # parley-coord
//!
//! Client for the etcd v3 HTTP/JSON gateway.
//!
//! - **Transport** - one request/response (or one streaming) call, no retries
//! - **AuthManager** - credentials and the current auth token
//! - **Client** - range reads, puts, leases and watches; every call is
//!   retried once after re-authenticating when the server rejects the token
//! - **Watcher** - long-lived prefix watch delivering events to a callback
//! - **Registry** - service node registration on top of leases
//!
//! ```rust,ignore
//! use parley_coord::{Client, RangeOptions};
//!
//! let client = Client::connect("127.0.0.1:2379")?;
//! client.auth("root", "secret").await?;
//! let kvs = client.get("/config/", RangeOptions::prefix("/config/")).await?;
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod kv;
pub mod registry;
pub mod transport;
pub mod watcher;

pub use auth::AuthManager;
pub use client::Client;
pub use error::CoordError;
pub use kv::{KeyValue, Lease, RangeOptions, SortOrder, SortTarget};
pub use registry::{Registry, ServiceEntry, ServiceNode};
pub use transport::{HttpTransport, JsonStream, Transport};
pub use watcher::{EventKind, WatchEnd, WatchEvent, Watcher};
