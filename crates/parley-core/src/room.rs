//! Room identifiers and their broker channels.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 64;

/// Prefix of every room channel.
pub const CHANNEL_PREFIX: &str = "room_";

/// Why a room id was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("Room id is required")]
    Missing,
    #[error("Room id cannot be empty")]
    Empty,
    #[error("Room id exceeds {MAX_ROOM_ID_LENGTH} characters")]
    TooLong,
    #[error("Room id may only contain letters, digits, '-' and '_'")]
    InvalidCharacters,
}

/// A validated room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Validate a raw room id.
    ///
    /// # Errors
    ///
    /// Returns the reason the id was rejected.
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        if raw.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if raw.len() > MAX_ROOM_ID_LENGTH {
            return Err(RoomIdError::TooLong);
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RoomIdError::InvalidCharacters);
        }
        Ok(Self(raw.to_string()))
    }

    /// Validate an optional request parameter.
    ///
    /// # Errors
    ///
    /// Returns [`RoomIdError::Missing`] when the parameter is absent.
    pub fn from_param(raw: Option<&str>) -> Result<Self, RoomIdError> {
        raw.ok_or(RoomIdError::Missing).and_then(Self::parse)
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Broker channel of this room: `room_{id}`.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        let longest = "x".repeat(MAX_ROOM_ID_LENGTH);
        for raw in ["1", "lobby", "room-42", "A_b-C", longest.as_str()] {
            let id = RoomId::parse(raw).unwrap();
            assert_eq!(id.as_str(), raw);
        }
    }

    #[test]
    fn test_invalid_ids() {
        assert_eq!(RoomId::parse(""), Err(RoomIdError::Empty));
        assert_eq!(
            RoomId::parse(&"x".repeat(MAX_ROOM_ID_LENGTH + 1)),
            Err(RoomIdError::TooLong)
        );
        assert_eq!(RoomId::parse("a b"), Err(RoomIdError::InvalidCharacters));
        assert_eq!(RoomId::parse("大厅"), Err(RoomIdError::InvalidCharacters));
        assert_eq!(RoomId::from_param(None), Err(RoomIdError::Missing));
    }

    #[test]
    fn test_channel_name() {
        let id: RoomId = "42".parse().unwrap();
        assert_eq!(id.channel(), "room_42");
        assert_eq!(id.to_string(), "42");
    }
}
