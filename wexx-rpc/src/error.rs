use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::retry::ConnectionState;
use crate::types;

pub type Result<T, E = JsonRpcError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum JsonRpcError {
    #[error("Error serializing request {type_name} to JSON")]
    SerRequest {
        source: serde_json::Error,
        type_name: &'static str,
    },
    #[error("Error serializing response {type_name} to JSON")]
    SerResponse {
        source: serde_json::Error,
        type_name: &'static str,
    },
    #[error("Error deserializing response to {type_name}")]
    DeserResponse {
        source: serde_json::Error,
        type_name: &'static str,
        response: JsonValue,
    },
    #[error("Transport error")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("Request ID {id} is already pending")]
    DuplicateId { id: types::Id },
    #[error("Remote peer returned an error calling '{method}': {error}")]
    Application {
        method: String,
        #[source]
        error: types::ErrorDetails,
    },
    #[error("Params for '{method}' must be an object or an array")]
    InvalidParams { method: String },
    #[error("Connection closed during request")]
    ConnectionClosed,
    #[error("Connection is already closed")]
    Disposed,
    #[error("Not connected")]
    NotConnected,
    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },
    #[error("Invalid connection state transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("A response has already been set for this request")]
    AlreadyResponded,
    #[error("BUG: {message}")]
    Bug { message: String },
}

impl JsonRpcError {
    /// The structured error reported by the remote peer, if this is an application error
    pub fn application_error(&self) -> Option<&types::ErrorDetails> {
        match self {
            JsonRpcError::Application { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Render the payload of a caught panic as a string for logging.
pub(crate) fn panic_err_to_string(err: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
