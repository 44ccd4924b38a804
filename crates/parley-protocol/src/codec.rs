//! Codec for encoding and decoding Parley frames.
//!
//! Frames are JSON text. Encoding leaves non-ASCII characters unescaped.

use bytes::Bytes;
use thiserror::Error;

use crate::frames::{Reply, Request};

/// Maximum accepted frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a reply to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode(reply: &Reply) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(reply)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Encode a reply into a broker payload.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_bytes(reply: &Reply) -> Result<Bytes, ProtocolError> {
    encode(reply).map(Bytes::from)
}

/// Decode a client request from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large, is not valid JSON, or has an
/// empty method name.
pub fn decode_request(text: &str) -> Result<Request, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let request: Request = serde_json::from_str(text)?;
    if request.method.is_empty() {
        return Err(ProtocolError::Invalid("method cannot be empty".to_string()));
    }

    Ok(request)
}

/// Decode a reply or notice from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid reply.
pub fn decode_reply(text: &str) -> Result<Reply, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
