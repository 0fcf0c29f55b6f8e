//! JSON-RPC 2.0 frame codec.
//!
//! Parses inbound payloads into [`Frame`]s and formats canonical wire
//! objects for requests, notifications, results, and errors.
//!
//! Classification is by id truthiness: a frame with a `method` is a
//! request only when its `id` is truthy. An `id` of `0`, `""`, `false`,
//! or `null` classifies the frame as a notification.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Well-known JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("parse error")]
    ParseError,
    #[error("invalid request")]
    InvalidRequest,
    #[error("method not found")]
    MethodNotFound,
    #[error("internal error")]
    Internal,
    #[error("server error")]
    Server,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::Internal => -32603,
            ErrorCode::Server => -32000,
        }
    }
}

/// A wire error object: `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("rpc error {code}: {message}")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Normalize an arbitrary failure into a wire error object.
    ///
    /// An [`ErrorObject`] in the chain passes through unchanged; a bare
    /// [`ErrorCode`] keeps its canonical message; anything else lands in
    /// the internal-error bucket with its message preserved.
    pub fn normalize(error: &anyhow::Error) -> Self {
        if let Some(object) = error.downcast_ref::<ErrorObject>() {
            return object.clone();
        }
        if let Some(code) = error.downcast_ref::<ErrorCode>() {
            return Self::from(*code);
        }
        Self::new(ErrorCode::Internal.code(), error.to_string())
    }
}

impl From<ErrorCode> for ErrorObject {
    fn from(code: ErrorCode) -> Self {
        Self::new(code.code(), code.to_string())
    }
}

impl From<&str> for ErrorObject {
    fn from(message: &str) -> Self {
        Self::new(ErrorCode::Internal.code(), message)
    }
}

impl From<i64> for ErrorObject {
    fn from(code: i64) -> Self {
        let message = match code {
            -32700 => "parse error",
            -32600 => "invalid request",
            -32601 => "method not found",
            -32603 => "internal error",
            -32000 => "server error",
            _ => "error",
        };
        Self::new(code, message)
    }
}

/// A decoded JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: String,
        method: String,
        params: Value,
    },
    Notify {
        method: String,
        params: Value,
    },
    Response {
        id: String,
        result: Result<Value, ErrorObject>,
    },
}

/// Frame decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FrameError {
    pub fn code(&self) -> i64 {
        match self {
            FrameError::Parse(_) => ErrorCode::ParseError.code(),
            FrameError::InvalidRequest(_) => ErrorCode::InvalidRequest.code(),
        }
    }
}

impl From<&FrameError> for ErrorObject {
    fn from(error: &FrameError) -> Self {
        ErrorObject::new(error.code(), error.to_string())
    }
}

/// Decode a raw payload.
pub fn parse_bytes(bytes: &[u8]) -> Result<Frame, FrameError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| FrameError::Parse(e.to_string()))?;
    parse_value(value)
}

/// Decode an already-deserialized payload.
pub fn parse_value(value: Value) -> Result<Frame, FrameError> {
    let object = value
        .as_object()
        .ok_or_else(|| FrameError::InvalidRequest("frame is not an object".into()))?;

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(FrameError::InvalidRequest(
            "jsonrpc version must be \"2.0\"".into(),
        ));
    }

    if let Some(method) = object.get("method") {
        let method = method
            .as_str()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| FrameError::InvalidRequest("method must be a non-empty string".into()))?
            .to_string();
        let params = object.get("params").cloned().unwrap_or(Value::Null);
        return Ok(match object.get("id").filter(|id| id_is_truthy(id)) {
            Some(id) => Frame::Request {
                id: id_to_string(id),
                method,
                params,
            },
            None => Frame::Notify { method, params },
        });
    }

    let id = object
        .get("id")
        .map(id_to_string)
        .ok_or_else(|| FrameError::InvalidRequest("response is missing an id".into()))?;
    if let Some(result) = object.get("result") {
        return Ok(Frame::Response {
            id,
            result: Ok(result.clone()),
        });
    }
    if let Some(error) = object.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| ErrorCode::Internal.code());
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("error")
            .to_string();
        return Ok(Frame::Response {
            id,
            result: Err(ErrorObject::new(code, message)),
        });
    }
    Err(FrameError::InvalidRequest(
        "frame carries neither method, result, nor error".into(),
    ))
}

fn id_is_truthy(id: &Value) -> bool {
    match id {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Formatters
// =============================================================================

pub fn format_request(id: &str, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn format_notify(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

pub fn format_result(id: &str, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Format an error reply. `id` is `None` for failures where the request id
/// never became known (e.g. unparseable frames), serialized as a null id.
pub fn format_error(id: Option<&str>, error: &ErrorObject) -> Value {
    let id = match id {
        Some(id) => Value::String(id.to_string()),
        None => Value::Null,
    };
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": error.code, "message": error.message }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let wire = format_request("7", "echo", json!("wuhu"));
        match parse_value(wire).unwrap() {
            Frame::Request { id, method, params } => {
                assert_eq!(id, "7");
                assert_eq!(method, "echo");
                assert_eq!(params, json!("wuhu"));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn notify_has_no_id() {
        let wire = format_notify("ping", json!({"seq": 1}));
        assert!(wire.get("id").is_none());
        assert!(matches!(parse_value(wire).unwrap(), Frame::Notify { .. }));
    }

    #[test]
    fn falsy_ids_classify_as_notify() {
        for id in [json!(null), json!(0), json!(""), json!(false)] {
            let wire = json!({ "jsonrpc": "2.0", "id": id, "method": "m", "params": null });
            assert!(
                matches!(parse_value(wire).unwrap(), Frame::Notify { .. }),
                "id {id} should classify as a notification"
            );
        }
    }

    #[test]
    fn numeric_id_is_stringified() {
        let wire = json!({ "jsonrpc": "2.0", "id": 12, "method": "m", "params": null });
        match parse_value(wire).unwrap() {
            Frame::Request { id, .. } => assert_eq!(id, "12"),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn wrong_version_is_invalid() {
        let wire = json!({ "jsonrpc": "1.0", "id": "1", "method": "m" });
        assert!(matches!(
            parse_value(wire),
            Err(FrameError::InvalidRequest(_))
        ));
    }

    #[test]
    fn empty_method_is_invalid() {
        let wire = json!({ "jsonrpc": "2.0", "id": "1", "method": "" });
        assert!(matches!(
            parse_value(wire),
            Err(FrameError::InvalidRequest(_))
        ));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            parse_bytes(b"{not json"),
            Err(FrameError::Parse(_))
        ));
    }

    #[test]
    fn response_result_and_error_decode() {
        let ok = json!({ "jsonrpc": "2.0", "id": "1", "result": "wuhu" });
        match parse_value(ok).unwrap() {
            Frame::Response { id, result } => {
                assert_eq!(id, "1");
                assert_eq!(result.unwrap(), json!("wuhu"));
            }
            other => panic!("expected response, got {other:?}"),
        }

        let err = json!({ "jsonrpc": "2.0", "id": "2", "error": { "code": -32601, "message": "nope" } });
        match parse_value(err).unwrap() {
            Frame::Response { result, .. } => {
                let error = result.unwrap_err();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "nope");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn error_normalization_accepts_heterogeneous_inputs() {
        // Numeric code keeps its canonical message.
        let from_code: ErrorObject = (-32601i64).into();
        assert_eq!(from_code.code, -32601);
        assert_eq!(from_code.message, "method not found");

        // Bare string lands in the internal bucket with the message kept.
        let from_str: ErrorObject = "invalid params".into();
        assert_eq!(from_str.code, -32603);
        assert_eq!(from_str.message, "invalid params");

        // An error object passes through a normalize round.
        let original = ErrorObject::new(-32000, "busy");
        let err: anyhow::Error = original.clone().into();
        assert_eq!(ErrorObject::normalize(&err), original);

        // An arbitrary error is internal with its message preserved.
        let arbitrary = anyhow::anyhow!("boom");
        let normalized = ErrorObject::normalize(&arbitrary);
        assert_eq!(normalized.code, -32603);
        assert_eq!(normalized.message, "boom");
    }

    #[test]
    fn null_id_error_reply() {
        let wire = format_error(None, &ErrorObject::from(ErrorCode::ParseError));
        assert_eq!(wire["id"], Value::Null);
        assert_eq!(wire["error"]["code"], json!(-32700));
    }
}
