//! Rust struct definitions that ser/de to/from JSON-RPC messages.
//!
//! These are the shapes that go out over the wire.  Inbound text is not deserialized directly into
//! these types; it is first classified by [`crate::protocol::classify`], which applies the looser
//! rules peers are allowed to rely on (null members treated as absent, numeric or string ids, and
//! so on) and then builds these structs.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{JsonRpcError, Result};
/// Re-export the structs and enums that are part of the JSON-RPC protocol
///
/// The Request and Response types are not suitable for our use case but these basic types are
/// exactly what we would declare ourselves.
pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};
pub use serde_json::Value as JsonValue;

/// Method name of the in-band liveness probe
pub const PING: &str = "ping";
/// Method name of the in-band liveness probe reply
pub const PONG: &str = "pong";

/// Error code used for application errors which don't specify one
pub const DEFAULT_APPLICATION_ERROR_CODE: i32 = -32000;

/// Request Id
#[derive(Debug, PartialEq, Clone, Hash, Eq, Deserialize, Serialize, PartialOrd, Ord)]
#[serde(untagged)]
pub enum Id {
    /// Null
    Null,
    /// Numeric id
    Number(u64),
    /// String id
    Str(String),
}

impl Id {
    /// Whether this id identifies a request.
    ///
    /// `null`, the empty string, and `0` do not; a message carrying one of those is treated as a
    /// notification.
    pub fn is_truthy(&self) -> bool {
        match self {
            Id::Null => false,
            Id::Number(n) => *n != 0,
            Id::Str(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Null => f.write_str("null"),
            Id::Number(n) => write!(f, "{n}"),
            Id::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Number(value)
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Str(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_string())
    }
}

/// Serializable [JSON-RPC request object](https://www.jsonrpc.org/specification#request-object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Request ID
    pub id: Id,
    /// Name of the method to be invoked.
    pub method: String,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Request {
    /// Create a serializable JSON-RPC method call.
    pub fn new(id: Id, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// Serializable [JSON-RPC notification object](https://www.jsonrpc.org/specification#request-object).
///
/// Differs from the request object in that it does not have an `id` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Name of the method to be invoked.
    pub method: String,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Notification {
    /// Create a serializable JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// JSON-RPC response object as defined in the [spec](https://www.jsonrpc.org/specification#response_object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Payload which can be result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
    /// Request ID
    pub id: Id,
}

impl Response {
    /// Create a owned successful response
    pub fn success(id: Id, result: JsonValue) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload: ResponsePayload::Success(SuccessResponse { result }),
            id,
        }
    }

    /// Create an error response
    pub fn error(
        id: Id,
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<Option<JsonValue>>,
    ) -> Self {
        Self::error_detail(id, ErrorDetails::new(code, message, data))
    }

    /// Create an error response from already-assembled error details
    pub fn error_detail(id: Id, error: ErrorDetails) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload: ResponsePayload::Error(ErrorResponse { error }),
            id,
        }
    }
}

/// Possible payloads of a JSON RPC response
///
/// This is an `untagged` enum so that serde will try to deserialize into each variant in order
/// until one succeeds.  This works because successs responses should have `result` and error
/// responses should have `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Corresponds to failed JSON-RPC response with a error object with the field `error.
    Error(ErrorResponse),
    /// Corresponds to successful JSON-RPC response with the field `result`.
    Success(SuccessResponse),
}

impl ResponsePayload {
    /// Create a successful response payload
    pub fn success(result: JsonValue) -> Self {
        ResponsePayload::Success(SuccessResponse { result })
    }

    /// Create an error response payload
    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        ResponsePayload::Error(details.into().into())
    }

    /// Collapse into a `Result`, which is how callers consume responses
    pub fn into_result(self) -> std::result::Result<JsonValue, ErrorDetails> {
        match self {
            ResponsePayload::Success(SuccessResponse { result }) => Ok(result),
            ResponsePayload::Error(ErrorResponse { error }) => Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

impl From<JsonValue> for SuccessResponse {
    fn from(result: JsonValue) -> Self {
        Self { result }
    }
}

/// [Failed JSON-RPC response object](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

impl From<ErrorDetails> for ErrorResponse {
    fn from(error: ErrorDetails) -> Self {
        Self { error }
    }
}

/// [JSON-RPC failed response error details](https://www.jsonrpc.org/specification#error_object).
///
/// Handlers return this (directly or wrapped in an [`anyhow::Error`]) to report an application
/// error to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {})", .code.code())]
pub struct ErrorDetails {
    /// Code
    pub code: ErrorCode,
    /// Message
    pub message: String,
    /// Optional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }

    /// Application error with the default application code
    pub fn application(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::from(DEFAULT_APPLICATION_ERROR_CODE), message, data)
    }

    /// Response to a request nothing in the dispatch pipeline answered
    pub fn unhandled_request(method: &str) -> Self {
        Self::method_not_found(format!("Unhandled request: {method}"), None)
    }

    /// The numeric error code
    pub fn code(&self) -> i32 {
        self.code.code()
    }
}

/// Every message this crate writes to the wire.
///
/// Serialized `untagged`, so the JSON is exactly that of the wrapped struct.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// A request with method, id, and optional params
    Request(Request),

    /// A notification with method and optional params but no id
    Notification(Notification),

    /// A response containing either a result or error
    Response(Response),
}

impl Message {
    /// Attempt to serialize this message into a string.
    ///
    /// This is fallible but unlikely to fail barring memory issues.
    pub fn serialize_to_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| JsonRpcError::SerRequest {
            source: e,
            type_name: std::any::type_name::<Self>(),
        })
    }

    /// Fields that help identify a message in log output: its kind, request ID and method.
    pub fn diagnostic_context(&self) -> (&'static str, Option<&Id>, Option<&str>) {
        match self {
            Message::Request(request) => ("request", Some(&request.id), Some(&request.method)),
            Message::Notification(notification) => ("notification", None, Some(&notification.method)),
            Message::Response(response) => ("response", Some(&response.id), None),
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::{Value, json};

    #[test]
    fn test_request_serialization() {
        let known_good_json = r#"{"jsonrpc":"2.0","method":"add","params":[1,2,3],"id":"1"}"#;
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let our_request = Request::new(Id::from("1"), "add", json!([1, 2, 3]));
        let our_json = Message::Request(our_request).serialize_to_string().unwrap();
        let our_value: Value = serde_json::from_str(&our_json).unwrap();

        assert_eq!(known_good_value, our_value);
    }

    #[test]
    fn test_absent_params_are_omitted() {
        let our_json = Message::Notification(Notification::new("ping", None))
            .serialize_to_string()
            .unwrap();
        assert_eq!(our_json, r#"{"jsonrpc":"2.0","method":"ping"}"#);
    }

    #[test]
    fn test_error_response_serialization() {
        let known_good_json = concat!(
            r#"{"jsonrpc":"2.0","error":{"code":-32600,"message":"Invalid request","#,
            r#""data":{"details":"error details"}},"id":"error-id"}"#
        );
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let our_response = Response::error(
            Id::from("error-id"),
            ErrorCode::InvalidRequest,
            "Invalid request",
            json!({"details": "error details"}),
        );
        let our_value = serde_json::to_value(Message::Response(our_response)).unwrap();

        assert_eq!(known_good_value, our_value);
    }

    #[test]
    fn test_unidentified_error_response_has_null_id() {
        let response = Response::error_detail(Id::Null, ErrorDetails::parse_error("Parse error", None));
        let value = serde_json::to_value(Message::Response(response)).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], json!(-32700));
    }

    #[test]
    fn test_id_truthiness() {
        assert!(!Id::Null.is_truthy());
        assert!(!Id::from("").is_truthy());
        assert!(!Id::Number(0).is_truthy());
        assert!(Id::from("1").is_truthy());
        assert!(Id::Number(7).is_truthy());
    }

    #[test]
    fn test_default_application_code() {
        let details = ErrorDetails::application("nope", None);
        assert_eq!(details.code(), -32000);
        assert_matches!(details.code, ErrorCode::ServerError(-32000));
        assert_eq!(details.to_string(), "nope (code -32000)");
    }

    #[test]
    fn test_payload_into_result() {
        assert_eq!(ResponsePayload::success(json!(6)).into_result(), Ok(json!(6)));
        assert_matches!(
            ResponsePayload::error(ErrorDetails::unhandled_request("nope")).into_result(),
            Err(ErrorDetails { code: ErrorCode::MethodNotFound, .. })
        );
    }
}
