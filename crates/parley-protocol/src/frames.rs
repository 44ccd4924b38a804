//! Frame types for the Parley protocol.
//!
//! Every frame is a JSON object. Requests carry a method name, positional
//! parameters and an optional id; replies and notices carry the method they
//! belong to, either a `result` or an `error`, and the id (null for notices).
//! Ids are opaque JSON values and are echoed back unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method used by clients to join a room.
pub const METHOD_ROOM_JOIN: &str = "room.join";

/// Method of notices relayed to every member of a room.
pub const METHOD_ROOM_MESSAGE: &str = "room.message";

/// Application error codes carried in [`ErrorObject::code`].
pub mod codes {
    /// Request parameters failed validation.
    pub const VALIDATION: i64 = 100_001;
    /// No handler is registered for the requested method.
    pub const METHOD_NOT_FOUND: i64 = 100_002;
    /// The frame could not be parsed as a request.
    pub const MALFORMED_REQUEST: i64 = 100_003;
    /// The join notice could not be published to the room.
    pub const BROADCAST_FAILED: i64 = 100_004;
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method name, e.g. `room.join`.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Request id echoed back in the reply. Any JSON value.
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    /// Create a request without an id.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Attach a request id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Get a positional parameter as a string.
    ///
    /// Returns `None` if the parameter is missing or is not a JSON string.
    #[must_use]
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(Value::as_str)
    }
}

/// Error payload of a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Application error code (see [`codes`]).
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

/// The `{message}` result shape used by join acknowledgements and room notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResult {
    /// Text shown to the user.
    pub message: String,
}

impl MessageResult {
    /// Create a new message result.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A reply to a request, or a server-pushed notice.
///
/// Serializes as `{"method", "result" | "error", "id"}`; `id` is always
/// present and is `null` for notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Method this frame belongs to.
    pub method: String,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Id of the request being answered.
    pub id: Option<Value>,
}

impl Reply {
    /// Create a successful reply.
    #[must_use]
    pub fn result(method: impl Into<String>, id: Option<Value>, result: Value) -> Self {
        Self {
            method: method.into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error reply.
    #[must_use]
    pub fn error(
        method: impl Into<String>,
        id: Option<Value>,
        code: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
            }),
            id,
        }
    }

    /// Create a notice (a result with a null id).
    #[must_use]
    pub fn notice(method: impl Into<String>, result: Value) -> Self {
        Self::result(method, None, result)
    }

    /// Check whether this reply carries an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_params() {
        let req: Request =
            serde_json::from_str(r#"{"method":"room.join","params":["lobby", 7],"id":3}"#).unwrap();
        assert_eq!(req.method, METHOD_ROOM_JOIN);
        assert_eq!(req.id, Some(json!(3)));
        assert_eq!(req.param_str(0), Some("lobby"));
        // Non-string and missing parameters
        assert_eq!(req.param_str(1), None);
        assert_eq!(req.param_str(2), None);
    }

    #[test]
    fn test_request_defaults() {
        let req: Request = serde_json::from_str(r#"{"method":"room.join"}"#).unwrap();
        assert!(req.params.is_empty());
        assert!(req.id.is_none());
    }

    #[test]
    fn test_notice_has_null_id() {
        let notice = Reply::notice(METHOD_ROOM_MESSAGE, json!({"message": "hi"}));
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(
            value,
            json!({"method": "room.message", "result": {"message": "hi"}, "id": null})
        );
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = Reply::error(METHOD_ROOM_JOIN, Some(json!(9)), codes::VALIDATION, "bad room");
        assert!(reply.is_error());
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["error"]["code"], 100_001);
        assert_eq!(value["id"], 9);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_non_numeric_ids_are_echoed() {
        for id in [json!("req-1"), json!(-4), json!(2.5), json!({"seq": 1})] {
            let text = json!({"method": "room.join", "params": ["a"], "id": id}).to_string();
            let req: Request = serde_json::from_str(&text).unwrap();
            assert_eq!(req.id.as_ref(), Some(&id));

            let reply = Reply::result(METHOD_ROOM_JOIN, req.id, json!({"message": "ok"}));
            assert_eq!(serde_json::to_value(&reply).unwrap()["id"], id);
        }

        let req = Request::new(METHOD_ROOM_JOIN, vec![]).with_id("abc");
        assert_eq!(req.id, Some(json!("abc")));
    }
}
