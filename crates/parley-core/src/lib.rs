//! # parley-core
//!
//! Rooms, sessions and the join relay of the Parley chat relay.
//!
//! - **Broker** - Pub/sub backend abstraction ([`MemoryBroker`], and
//!   `RedisBroker` with the `redis` feature)
//! - **Pool** - Bounded pool of publishing connections
//! - **Session** - Per-connection room and subscription state
//! - **Subscription** - Task forwarding one channel into a session's outbound queue
//! - **Relay** - The room join protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ join ┌─────────────┐ subscribe ┌─────────────┐
//! │   Session   │─────▶│  RoomRelay  │──────────▶│   Broker    │
//! └─────────────┘      └─────────────┘           └─────────────┘
//!        ▲                    │ publish notice          │
//!        │ Outbound           ▼                         │
//!        │             ┌─────────────┐                  │
//!        └─────────────│ Subscription│◀─────────────────┘
//!                      └─────────────┘
//! ```

pub mod broker;
pub mod error;
pub mod memory;
pub mod pool;
#[cfg(feature = "redis")]
pub mod redis_broker;
pub mod relay;
pub mod room;
pub mod session;
pub mod subscription;

pub use broker::{Broker, BrokerConnection, BrokerError, MessageStream};
pub use error::RelayError;
pub use memory::MemoryBroker;
pub use pool::{ConnectionPool, PooledConnection};
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;
pub use relay::{BroadcastFailurePolicy, RelayConfig, RoomRelay};
pub use room::{RoomId, RoomIdError};
pub use session::{outbound_queue, Outbound, OutboundReceiver, OutboundSender, Session};
pub use subscription::{Subscription, SubscriptionExit};
