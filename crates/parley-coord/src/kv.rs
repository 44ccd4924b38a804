//! Key/value and lease types, and the gateway's wire encodings.
//!
//! The gateway carries keys and values as base64 and 64-bit integers as
//! JSON strings. Everything here converts to and from those forms so that
//! callers only ever see raw bytes and numbers.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::CoordError;

/// Encode raw bytes the way the gateway expects.
#[must_use]
pub fn encode_bytes(raw: impl AsRef<[u8]>) -> String {
    STANDARD.encode(raw)
}

/// Decode a base64 field into raw bytes.
///
/// # Errors
///
/// Returns [`CoordError::Decode`] if the field is not base64.
pub fn decode_bytes(encoded: &str) -> Result<Bytes, CoordError> {
    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| CoordError::Decode(format!("invalid base64: {e}")))
}

/// Decode a base64 field into a UTF-8 string.
///
/// # Errors
///
/// Returns [`CoordError::Decode`] if the field is not base64 or not UTF-8.
pub fn decode_string(encoded: &str) -> Result<String, CoordError> {
    let raw = decode_bytes(encoded)?;
    String::from_utf8(raw.to_vec()).map_err(|e| CoordError::Decode(format!("invalid UTF-8: {e}")))
}

/// Compute the range end that selects every key starting with `prefix`.
///
/// An empty prefix, or one made only of `0xff` bytes, selects all keys.
#[must_use]
pub fn prefix_range_end(prefix: impl AsRef<[u8]>) -> Vec<u8> {
    let mut end = prefix.as_ref().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Int64 {
    Str(String),
    Num(i64),
}

impl Int64 {
    fn into_i64<E: de::Error>(self) -> Result<i64, E> {
        match self {
            Int64::Num(n) => Ok(n),
            Int64::Str(s) => s.parse().map_err(E::custom),
        }
    }
}

/// Deserialize an int64 that may be encoded as a string.
pub(crate) fn int64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Int64::deserialize(d)?.into_i64()
}

/// Deserialize an optional int64 that may be encoded as a string.
pub(crate) fn opt_int64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Option::<Int64>::deserialize(d)?
        .map(Int64::into_i64)
        .transpose()
}

/// Sort order of a range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    None,
    Ascend,
    Descend,
}

/// Field a range read is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortTarget {
    Key,
    Version,
    Create,
    Mod,
    Value,
}

/// Options for a range read.
///
/// Unset fields are omitted from the request and take the server default.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RangeOptions {
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "ser_bytes")]
    pub range_end: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_target: Option<SortTarget>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub serializable: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub keys_only: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub count_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_mod_revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_mod_revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_create_revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_create_revision: Option<i64>,
}

fn ser_bytes<S: serde::Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(raw) => s.serialize_str(&encode_bytes(raw)),
        None => s.serialize_none(),
    }
}

impl RangeOptions {
    /// Options for reading exactly one key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options selecting every key under `prefix`.
    #[must_use]
    pub fn prefix(prefix: impl AsRef<[u8]>) -> Self {
        Self {
            range_end: Some(prefix_range_end(prefix)),
            ..Self::default()
        }
    }

    /// Read up to (but excluding) `end`.
    #[must_use]
    pub fn with_range_end(mut self, end: impl AsRef<[u8]>) -> Self {
        self.range_end = Some(end.as_ref().to_vec());
        self
    }

    /// Limit the number of returned keys.
    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Read at a past revision.
    #[must_use]
    pub fn at_revision(mut self, revision: i64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Sort the result.
    #[must_use]
    pub fn sorted(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort_target = Some(target);
        self.sort_order = Some(order);
        self
    }

    /// Return keys without values.
    #[must_use]
    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    /// Return only the number of matching keys.
    #[must_use]
    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    /// Allow a serializable (possibly stale, local) read.
    #[must_use]
    pub fn serializable(mut self) -> Self {
        self.serializable = true;
        self
    }
}

/// A key/value pair as stored by the coordination service.
///
/// Keys and values are arbitrary bytes. Use [`KeyValue::key_str`] and
/// [`KeyValue::value_str`] when text is expected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    /// Empty when the read was keys-only.
    pub value: Bytes,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    /// Attached lease id, 0 when none.
    pub lease: i64,
}

/// Key/value as it appears on the wire.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawKeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "int64")]
    create_revision: i64,
    #[serde(default, deserialize_with = "int64")]
    mod_revision: i64,
    #[serde(default, deserialize_with = "int64")]
    version: i64,
    #[serde(default, deserialize_with = "int64")]
    lease: i64,
}

impl KeyValue {
    /// The key as text, with invalid UTF-8 replaced. Meant for logging.
    #[must_use]
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    /// The value as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::Decode`] if the value is not valid UTF-8.
    pub fn value_str(&self) -> Result<&str, CoordError> {
        std::str::from_utf8(&self.value)
            .map_err(|e| CoordError::Decode(format!("invalid UTF-8 value: {e}")))
    }
}

impl TryFrom<RawKeyValue> for KeyValue {
    type Error = CoordError;

    fn try_from(raw: RawKeyValue) -> Result<Self, Self::Error> {
        Ok(Self {
            key: decode_bytes(&raw.key)?,
            value: decode_bytes(&raw.value)?,
            create_revision: raw.create_revision,
            mod_revision: raw.mod_revision,
            version: raw.version,
            lease: raw.lease,
        })
    }
}

/// Response header shared by all RPCs.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResponseHeader {
    #[serde(default, deserialize_with = "int64")]
    pub revision: i64,
}

/// Range response.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<RawKeyValue>,
    #[serde(default, deserialize_with = "int64")]
    pub count: i64,
}

/// A lease and its remaining time to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    /// Seconds.
    pub ttl: i64,
}

/// Lease fields as returned by grant and keepalive.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawLease {
    #[serde(rename = "ID", default, deserialize_with = "opt_int64")]
    pub id: Option<i64>,
    #[serde(rename = "TTL", default, deserialize_with = "opt_int64")]
    pub ttl: Option<i64>,
}

impl RawLease {
    /// Both fields, or `None` when either is missing.
    pub(crate) fn complete(&self) -> Option<Lease> {
        Some(Lease {
            id: self.id?,
            ttl: self.ttl?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("abc"), b"abd".to_vec());
        assert_eq!(prefix_range_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_range_end(b"\xff\xff"), vec![0]);
        assert_eq!(prefix_range_end(""), vec![0]);
    }

    #[test]
    fn test_decode_key_value() {
        let raw: RawKeyValue = serde_json::from_value(json!({
            "key": encode_bytes("/svc/a"),
            "value": encode_bytes("héllo"),
            "create_revision": "4",
            "mod_revision": "9",
            "version": 2
        }))
        .unwrap();
        let kv = KeyValue::try_from(raw).unwrap();
        assert_eq!(kv.key, "/svc/a");
        assert_eq!(kv.value_str().unwrap(), "héllo");
        assert_eq!(kv.mod_revision, 9);
        assert_eq!(kv.version, 2);
        assert_eq!(kv.lease, 0);
    }

    #[test]
    fn test_decode_binary_value() {
        let raw: RawKeyValue = serde_json::from_value(json!({
            "key": encode_bytes(b"/bin/\xff"),
            "value": encode_bytes([0xff, 0x00, 0xfe]),
        }))
        .unwrap();
        let kv = KeyValue::try_from(raw).unwrap();
        assert_eq!(&kv.value[..], &[0xff, 0x00, 0xfe]);
        assert_eq!(kv.key_str(), "/bin/\u{fffd}");
        assert!(matches!(kv.value_str(), Err(CoordError::Decode(_))));
        assert!(matches!(
            decode_string(&encode_bytes([0xff])),
            Err(CoordError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(matches!(
            decode_string("%%%"),
            Err(CoordError::Decode(_))
        ));
    }

    #[test]
    fn test_range_options_serialization() {
        let value = serde_json::to_value(
            RangeOptions::prefix("a")
                .with_limit(10)
                .sorted(SortTarget::Mod, SortOrder::Descend)
                .keys_only(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({
                "range_end": encode_bytes("b"),
                "limit": 10,
                "sort_order": "DESCEND",
                "sort_target": "MOD",
                "keys_only": true
            })
        );

        assert_eq!(serde_json::to_value(RangeOptions::new()).unwrap(), json!({}));
    }

    #[test]
    fn test_raw_lease_completeness() {
        let lease: RawLease = serde_json::from_value(json!({"ID": "7", "TTL": "30"})).unwrap();
        assert_eq!(lease.complete(), Some(Lease { id: 7, ttl: 30 }));

        let lease: RawLease = serde_json::from_value(json!({"ID": "7"})).unwrap();
        assert_eq!(lease.complete(), None);
    }
}
