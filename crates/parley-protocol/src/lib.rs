//! # parley-protocol
//!
//! Wire protocol definitions for the Parley room relay.
//!
//! Clients talk to the server over WebSocket text frames carrying JSON.
//! A client sends a [`Request`]; the server answers with a [`Reply`] that
//! echoes the request id, and pushes room traffic as notices whose `id` is
//! always `null`.
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Reply};
//! use serde_json::json;
//!
//! let notice = Reply::notice("room.message", json!({"message": "héllo"}));
//! let text = codec::encode(&notice).unwrap();
//! assert_eq!(text, r#"{"method":"room.message","result":{"message":"héllo"},"id":null}"#);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode_request, encode, ProtocolError};
pub use frames::{codes, ErrorObject, MessageResult, Reply, Request};
pub use frames::{METHOD_ROOM_JOIN, METHOD_ROOM_MESSAGE};
