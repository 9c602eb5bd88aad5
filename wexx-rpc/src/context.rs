//! The per-request envelope passed down the dispatch pipeline.
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::connection::ConnectionHandle;
use crate::extensions::Extensions;
use crate::types::{self, ErrorDetails, Id, JsonValue};
use crate::{JsonRpcError, Result};

/// What the pipeline decided to answer
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing has answered yet
    Pending,
    Result(JsonValue),
    Error(ErrorDetails),
    /// Deliberately send no response at all
    Suppressed,
}

/// One inbound request making its way through the middleware chain.
///
/// The outcome can be set exactly once; later attempts fail with
/// [`JsonRpcError::AlreadyResponded`] and leave the first outcome in place.
#[derive(Debug)]
pub struct Context {
    connection: ConnectionHandle,
    request: types::Request,
    created_at: Instant,
    extensions: Extensions,
    outcome: Outcome,
}

impl Context {
    pub fn new(connection: ConnectionHandle, request: types::Request) -> Self {
        Self {
            connection,
            request,
            created_at: Instant::now(),
            extensions: Extensions::new(),
            outcome: Outcome::Pending,
        }
    }

    /// Handle to the connection the request arrived on
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn request(&self) -> &types::Request {
        &self.request
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn id(&self) -> &Id {
        &self.request.id
    }

    pub fn params(&self) -> Option<&JsonValue> {
        self.request.params.as_ref()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// When dispatch of this request started
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Whether something already answered this request
    pub fn is_responded(&self) -> bool {
        !matches!(self.outcome, Outcome::Pending)
    }

    pub fn set_result(&mut self, result: JsonValue) -> Result<()> {
        self.set_outcome(Outcome::Result(result))
    }

    /// Serialize `value` and set it as the result
    pub fn respond_with<T: Serialize>(&mut self, value: T) -> Result<()> {
        let result = serde_json::to_value(value).map_err(|e| JsonRpcError::SerResponse {
            source: e,
            type_name: std::any::type_name::<T>(),
        })?;
        self.set_result(result)
    }

    pub fn set_error(&mut self, error: ErrorDetails) -> Result<()> {
        self.set_outcome(Outcome::Error(error))
    }

    /// Answer the request with nothing at all
    pub fn suppress(&mut self) -> Result<()> {
        self.set_outcome(Outcome::Suppressed)
    }

    fn set_outcome(&mut self, outcome: Outcome) -> Result<()> {
        if self.is_responded() {
            tracing::warn!(request_id = %self.request.id, method = %self.request.method,
                existing = ?self.outcome, rejected = ?outcome,
                "Request already has a response; ignoring the new one");
            return Err(JsonRpcError::AlreadyResponded);
        }
        self.outcome = outcome;
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (types::Request, Outcome) {
        (self.request, self.outcome)
    }
}
