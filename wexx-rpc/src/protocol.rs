//! Classification of inbound wire text into typed messages.
//!
//! Peers are not held to strict JSON-RPC 2.0: the `jsonrpc` member is ignored, members set to
//! `null` count as absent (except `result`, where `null` is a legitimate value), and ids may be
//! strings or non-negative integers.  What matters is the combination of members present, which
//! is decided by a fixed priority order in [`classify`].
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::types::{self, ErrorCode, ErrorDetails, Id};
use crate::{JsonRpcError, Result};

/// A successfully classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A method call the remote peer expects exactly one response to
    Request(types::Request),
    /// A response (result or error) to a request we sent earlier
    Response(types::Response),
    /// A fire-and-forget notification
    Notification(types::Notification),
    /// An error the remote peer reported without tying it to any request
    NotificationError(ErrorDetails),
}

impl Inbound {
    /// Short name of the message kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Request(_) => "request",
            Inbound::Response(types::Response {
                payload: types::ResponsePayload::Success(_),
                ..
            }) => "response_result",
            Inbound::Response(_) => "response_error",
            Inbound::Notification(_) => "notification",
            Inbound::NotificationError(_) => "notification_error",
        }
    }
}

/// Inbound text that could not be classified.
///
/// These are answered in-band with an error response; they never close the connection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("Parse error: {reason}")]
    Parse { reason: String },
    #[error("Invalid request: {reason}")]
    InvalidRequest { id: Option<Id>, reason: String },
    #[error("params must be object")]
    InvalidParams { id: Option<Id> },
    #[error("Unhandled message shape")]
    UnhandledShape { id: Option<Id> },
}

impl FrameError {
    /// The id of the offending message, if it carried a usable one
    pub fn id(&self) -> Option<&Id> {
        match self {
            FrameError::Parse { .. } => None,
            FrameError::InvalidRequest { id, .. }
            | FrameError::InvalidParams { id }
            | FrameError::UnhandledShape { id } => id.as_ref(),
        }
    }

    pub fn details(&self) -> ErrorDetails {
        match self {
            FrameError::Parse { .. } => ErrorDetails::parse_error("Parse error", None),
            FrameError::InvalidRequest { reason, .. } => ErrorDetails::invalid_request(reason.clone(), None),
            // Non-structured params are reported as an invalid request, not -32602
            FrameError::InvalidParams { .. } => ErrorDetails::invalid_request("params must be object", None),
            FrameError::UnhandledShape { .. } => {
                ErrorDetails::invalid_request("Failed to parse message", None)
            }
        }
    }

    /// The error response to send back to the peer.  Falls back to a `null` id when the offending
    /// message had no usable one.
    pub fn to_response(&self) -> types::Response {
        let id = self.id().filter(|id| id.is_truthy()).cloned().unwrap_or(Id::Null);
        types::Response::error_detail(id, self.details())
    }
}

fn invalid(id: &Option<Id>, reason: impl Into<String>) -> FrameError {
    FrameError::InvalidRequest {
        id: id.clone(),
        reason: reason.into(),
    }
}

/// Read a member, treating an explicit `null` as absent
fn member<'a>(object: &'a Map<String, JsonValue>, name: &str) -> Option<&'a JsonValue> {
    object.get(name).filter(|value| !value.is_null())
}

fn parse_id(value: Option<&JsonValue>) -> std::result::Result<Option<Id>, String> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(Id::Str(s.clone()))),
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .map(|n| Some(Id::Number(n)))
            .ok_or_else(|| format!("unsupported numeric id {n}")),
        Some(other) => Err(format!("id must be a string or number, got {other}")),
    }
}

fn parse_error_member(value: &JsonValue, id: &Option<Id>) -> std::result::Result<ErrorDetails, FrameError> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid(id, "error must be an object"))?;

    let message = match object.get("message") {
        Some(JsonValue::String(message)) if !message.is_empty() => message.clone(),
        _ => return Err(invalid(id, "error must carry a non-empty message")),
    };

    let code = match member(object, "code") {
        None => types::DEFAULT_APPLICATION_ERROR_CODE,
        Some(code) => code
            .as_i64()
            .and_then(|code| i32::try_from(code).ok())
            .ok_or_else(|| invalid(id, "error code must be an integer"))?,
    };

    Ok(ErrorDetails::new(
        ErrorCode::from(code),
        message,
        member(object, "data").cloned(),
    ))
}

/// Classify one frame of inbound text.
pub fn classify(raw: &str) -> std::result::Result<Inbound, FrameError> {
    let value: JsonValue = serde_json::from_str(raw).map_err(|e| FrameError::Parse {
        reason: e.to_string(),
    })?;

    let JsonValue::Object(mut object) = value else {
        return Err(invalid(&None, "message must be an object"));
    };

    let id = parse_id(object.get("id")).map_err(|reason| invalid(&None, reason))?;
    let id_truthy = id.as_ref().is_some_and(Id::is_truthy);

    let params = match object.remove("params") {
        None | Some(JsonValue::Null) => None,
        Some(params @ (JsonValue::Object(_) | JsonValue::Array(_))) => Some(params),
        Some(_) => return Err(FrameError::InvalidParams { id }),
    };

    let method = match member(&object, "method") {
        None => None,
        Some(JsonValue::String(method)) => Some(method.clone()),
        Some(_) => return Err(invalid(&id, "method must be a string")),
    };

    // `result: null` is a perfectly good result
    let result = object.remove("result");

    let error = member(&object, "error")
        .map(|error| parse_error_member(error, &id))
        .transpose()?;

    match id {
        Some(id) if id_truthy && result.is_some() => {
            if error.is_some() || method.is_some() || params.is_some() {
                return Err(invalid(&Some(id), "response with result must not carry error, method or params"));
            }
            Ok(Inbound::Response(types::Response::success(
                id,
                result.unwrap_or(JsonValue::Null),
            )))
        }
        Some(id) if id_truthy && error.is_some() => {
            if method.is_some() || params.is_some() {
                return Err(invalid(&Some(id), "error response must not carry method or params"));
            }
            match error {
                Some(error) => Ok(Inbound::Response(types::Response::error_detail(id, error))),
                None => Err(FrameError::UnhandledShape { id: Some(id) }),
            }
        }
        id if !id_truthy && method.is_some() && error.is_none() => {
            if result.is_some() {
                return Err(invalid(&id, "notification must not carry a result"));
            }
            Ok(Inbound::Notification(types::Notification::new(
                method.unwrap_or_default(),
                params,
            )))
        }
        id if !id_truthy && error.is_some() => {
            if method.is_some() || result.is_some() {
                return Err(invalid(&id, "error notification must not carry method or result"));
            }
            match error {
                Some(error) => Ok(Inbound::NotificationError(error)),
                None => Err(FrameError::UnhandledShape { id }),
            }
        }
        Some(id) if id_truthy => match method {
            Some(method) => Ok(Inbound::Request(types::Request::new(id, method, params))),
            None => Err(invalid(&Some(id), "method missing")),
        },
        id => Err(FrameError::UnhandledShape { id }),
    }
}

/// Serialize an outbound message to wire text, stamping the protocol version
pub fn serialize(message: &types::Message) -> Result<String> {
    message.serialize_to_string()
}

/// Check outbound params the way [`classify`] checks inbound ones: an object, an array, or
/// nothing at all (`null` counts as nothing).
pub(crate) fn outbound_params(method: &str, params: Option<JsonValue>) -> Result<Option<JsonValue>> {
    match params {
        None | Some(JsonValue::Null) => Ok(None),
        Some(params @ (JsonValue::Object(_) | JsonValue::Array(_))) => Ok(Some(params)),
        Some(_) => Err(JsonRpcError::InvalidParams {
            method: method.to_string(),
        }),
    }
}

/// Deserialize a successful result into the type the caller expects
pub(crate) fn decode_result<T: serde::de::DeserializeOwned>(result: JsonValue) -> Result<T> {
    serde_json::from_value(result.clone()).map_err(|e| JsonRpcError::DeserResponse {
        source: e,
        type_name: std::any::type_name::<T>(),
        response: result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_response_result() {
        let inbound = classify(r#"{"jsonrpc":"2.0","id":"1","result":6}"#).unwrap();
        assert_eq!(inbound, Inbound::Response(types::Response::success(Id::from("1"), json!(6))));
        assert_eq!(inbound.kind(), "response_result");
    }

    #[test]
    fn test_null_result_is_still_a_result() {
        let inbound = classify(r#"{"id":"1","result":null}"#).unwrap();
        assert_eq!(inbound, Inbound::Response(types::Response::success(Id::from("1"), JsonValue::Null)));
    }

    #[test]
    fn test_response_error() {
        let inbound = classify(r#"{"id":"1","error":{"message":"nope","code":-32001,"data":[1]}}"#).unwrap();
        assert_matches!(
            inbound,
            Inbound::Response(types::Response {
                payload: types::ResponsePayload::Error(types::ErrorResponse { error }),
                ..
            }) if error.code() == -32001 && error.message == "nope" && error.data == Some(json!([1]))
        );
    }

    #[test]
    fn test_error_without_code_gets_default() {
        let inbound = classify(r#"{"error":{"message":"async failure"}}"#).unwrap();
        assert_matches!(inbound, Inbound::NotificationError(error) if error.code() == -32000);
    }

    #[test]
    fn test_error_requires_message() {
        let err = classify(r#"{"id":"3","error":{"code":1,"message":""}}"#).unwrap_err();
        assert_matches!(err, FrameError::InvalidRequest { id: Some(Id::Str(ref id)), .. } if id == "3");
        assert_eq!(err.to_response().id, Id::from("3"));
    }

    #[test]
    fn test_notification() {
        assert_eq!(
            classify(r#"{"method":"tick","params":{"n":1}}"#).unwrap(),
            Inbound::Notification(types::Notification::new("tick", json!({"n": 1})))
        );
        // A null or empty id is still a notification
        assert_matches!(
            classify(r#"{"id":null,"method":"tick"}"#).unwrap(),
            Inbound::Notification(_)
        );
        assert_matches!(classify(r#"{"id":"","method":"tick"}"#).unwrap(), Inbound::Notification(_));
    }

    #[test]
    fn test_request() {
        assert_eq!(
            classify(r#"{"id":"7","method":"add","params":[1,2,3]}"#).unwrap(),
            Inbound::Request(types::Request::new(Id::from("7"), "add", json!([1, 2, 3])))
        );
        assert_matches!(
            classify(r#"{"id":7,"method":"add"}"#).unwrap(),
            Inbound::Request(types::Request { id: Id::Number(7), params: None, .. })
        );
    }

    #[test]
    fn test_not_json_is_parse_error() {
        let err = classify("{not json").unwrap_err();
        assert_matches!(err, FrameError::Parse { .. });
        let response = err.to_response();
        assert_eq!(response.id, Id::Null);
        assert_matches!(
            response.payload.into_result(),
            Err(ErrorDetails { code: ErrorCode::ParseError, .. })
        );
    }

    #[test]
    fn test_scalar_params_rejected() {
        let err = classify(r#"{"id":"9","method":"add","params":"not-an-object"}"#).unwrap_err();
        assert_eq!(err, FrameError::InvalidParams { id: Some(Id::from("9")) });
        let response = err.to_response();
        assert_eq!(response.id, Id::from("9"));
        assert_matches!(
            response.payload.into_result(),
            Err(ErrorDetails { code: ErrorCode::InvalidRequest, .. })
        );
    }

    #[test]
    fn test_non_object_message_rejected() {
        assert_matches!(classify("[1,2]").unwrap_err(), FrameError::InvalidRequest { id: None, .. });
        assert_matches!(classify("42").unwrap_err(), FrameError::InvalidRequest { id: None, .. });
    }

    #[test]
    fn test_bad_id_type_rejected() {
        assert_matches!(
            classify(r#"{"id":{"a":1},"method":"x"}"#).unwrap_err(),
            FrameError::InvalidRequest { id: None, .. }
        );
        assert_matches!(
            classify(r#"{"id":-1,"method":"x"}"#).unwrap_err(),
            FrameError::InvalidRequest { id: None, .. }
        );
    }

    #[test]
    fn test_method_missing_with_id() {
        let err = classify(r#"{"id":"4","params":[]}"#).unwrap_err();
        assert_matches!(err, FrameError::InvalidRequest { ref reason, .. } if reason == "method missing");
    }

    #[test]
    fn test_unhandled_shape() {
        let err = classify(r#"{"params":[]}"#).unwrap_err();
        assert_eq!(err, FrameError::UnhandledShape { id: None });
        assert_eq!(err.to_response().id, Id::Null);
        assert_matches!(classify("{}").unwrap_err(), FrameError::UnhandledShape { .. });
    }

    #[test]
    fn test_conflicting_members_rejected() {
        // result plus method
        assert_matches!(
            classify(r#"{"id":"1","result":1,"method":"x"}"#).unwrap_err(),
            FrameError::InvalidRequest { .. }
        );
        // result plus error
        assert_matches!(
            classify(r#"{"id":"1","result":1,"error":{"message":"m"}}"#).unwrap_err(),
            FrameError::InvalidRequest { .. }
        );
        // error response with params
        assert_matches!(
            classify(r#"{"id":"1","error":{"message":"m"},"params":[]}"#).unwrap_err(),
            FrameError::InvalidRequest { .. }
        );
        // notification with a result
        assert_matches!(
            classify(r#"{"method":"x","result":1}"#).unwrap_err(),
            FrameError::InvalidRequest { .. }
        );
        // error notification with method falls into the notification row only if error absent
        assert_matches!(
            classify(r#"{"method":"x","error":{"message":"m"}}"#).unwrap_err(),
            FrameError::InvalidRequest { .. }
        );
    }

    #[test]
    fn test_every_shape_has_exactly_one_outcome() {
        // Walk every combination of members and make sure classification always lands somewhere,
        // and that successes match the member combination.
        let ids = [None, Some(json!(null)), Some(json!("")), Some(json!("5"))];
        let methods = [None, Some(json!("m"))];
        let params = [None, Some(json!([1]))];
        let results = [None, Some(json!(1))];
        let errors = [None, Some(json!({"message": "e"}))];

        for id in &ids {
            for method in &methods {
                for param in &params {
                    for result in &results {
                        for error in &errors {
                            let mut object = Map::new();
                            let members = [
                                ("id", id),
                                ("method", method),
                                ("params", param),
                                ("result", result),
                                ("error", error),
                            ];
                            for (name, value) in members {
                                if let Some(value) = value {
                                    object.insert(name.to_string(), value.clone());
                                }
                            }
                            let raw = JsonValue::Object(object).to_string();
                            let truthy = id.as_ref().is_some_and(|id| id == &json!("5"));

                            match classify(&raw) {
                                Ok(Inbound::Request(_)) => {
                                    assert!(truthy && method.is_some() && result.is_none() && error.is_none(), "{raw}")
                                }
                                Ok(Inbound::Response(_)) => assert!(truthy, "{raw}"),
                                Ok(Inbound::Notification(_)) => {
                                    assert!(!truthy && method.is_some() && error.is_none(), "{raw}")
                                }
                                Ok(Inbound::NotificationError(_)) => {
                                    assert!(!truthy && error.is_some() && method.is_none(), "{raw}")
                                }
                                Err(_) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_outbound_params_must_be_structured() {
        assert_eq!(outbound_params("m", None).unwrap(), None);
        assert_eq!(outbound_params("m", Some(JsonValue::Null)).unwrap(), None);
        assert_eq!(outbound_params("m", Some(json!([1]))).unwrap(), Some(json!([1])));
        assert_eq!(outbound_params("m", Some(json!({"a": 1}))).unwrap(), Some(json!({"a": 1})));

        for scalar in [json!(42.5), json!("text"), json!(true)] {
            assert_matches!(
                outbound_params("store", Some(scalar)),
                Err(JsonRpcError::InvalidParams { method }) if method == "store"
            );
        }
    }
}
