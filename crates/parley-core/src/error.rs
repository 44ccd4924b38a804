//! Relay errors.

use parley_protocol::{codes, ProtocolError};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::room::RoomIdError;

/// Errors returned by [`crate::RoomRelay::join`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// The room id was rejected; nothing was changed.
    #[error("Invalid room id: {0}")]
    Validation(#[from] RoomIdError),

    /// The join notice could not be published.
    #[error("Join notice broadcast failed: {0}")]
    Broadcast(#[from] BrokerError),

    /// The join notice could not be encoded.
    #[error("Join notice encoding failed: {0}")]
    Protocol(#[from] ProtocolError),
}

impl RelayError {
    /// Application error code reported to the client.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Validation(_) => codes::VALIDATION,
            Self::Broadcast(_) | Self::Protocol(_) => codes::BROADCAST_FAILED,
        }
    }

    /// Check if the error is a validation failure.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
