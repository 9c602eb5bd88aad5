//! Correlation of outbound requests with the responses the remote peer eventually sends.
//!
//! Owned exclusively by a connection's event loop, so there is no locking here.
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::types::{self, Id, JsonValue};
use crate::{JsonRpcError, Result};

/// Channel on which the outcome of one outbound request is delivered
pub(crate) type Completion = oneshot::Sender<Result<JsonValue>>;

struct PendingRequest {
    method: String,
    completion: Completion,
    deadline: Option<(Instant, Duration)>,
}

/// Map of request ID to the caller waiting on that request, plus the counter that IDs are
/// allocated from.
#[derive(Default)]
pub(crate) struct RequestTracker {
    next_id: u64,
    pending: HashMap<Id, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request ID.  IDs are never reused for the life of the tracker.
    pub fn next_id(&mut self) -> Id {
        self.next_id += 1;
        Id::Str(self.next_id.to_string())
    }

    /// Start tracking a request that has been written to the transport.
    ///
    /// A duplicate ID means a bug in ID allocation; the completion is handed back unused so the
    /// caller can fail it.
    pub fn track(
        &mut self,
        id: Id,
        method: impl Into<String>,
        completion: Completion,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), (JsonRpcError, Completion)> {
        if self.pending.contains_key(&id) {
            tracing::error!(request_id = %id, "BUG: request ID is already pending");
            return Err((JsonRpcError::DuplicateId { id }, completion));
        }

        let deadline = timeout.and_then(|timeout| Some((Instant::now().checked_add(timeout)?, timeout)));
        self.pending.insert(
            id,
            PendingRequest {
                method: method.into(),
                completion,
                deadline,
            },
        );
        Ok(())
    }

    /// Complete a pending request successfully
    pub fn resolve(&mut self, id: &Id, result: JsonValue) {
        match self.pending.remove(id) {
            Some(pending) => {
                let _ = pending.completion.send(Ok(result));
            }
            None => {
                tracing::warn!(request_id = %id, "Received result for unknown request ID");
            }
        }
    }

    /// Fail a pending request with an error reported by the remote peer
    pub fn reject(&mut self, id: &Id, error: types::ErrorDetails) {
        match self.pending.remove(id) {
            Some(pending) => {
                let _ = pending.completion.send(Err(JsonRpcError::Application {
                    method: pending.method,
                    error,
                }));
            }
            None => {
                tracing::warn!(request_id = %id, code = error.code(), message = %error.message,
                    "Received error for unknown request ID");
            }
        }
    }

    /// Route a response to whichever caller is waiting on it
    pub fn complete(&mut self, response: types::Response) {
        match response.payload.into_result() {
            Ok(result) => self.resolve(&response.id, result),
            Err(error) => self.reject(&response.id, error),
        }
    }

    /// Fail every pending request.  `make_error` is called once per request since errors can't be
    /// cloned.
    pub fn fail_all(&mut self, make_error: impl Fn() -> JsonRpcError) -> usize {
        let count = self.pending.len();
        for (id, pending) in self.pending.drain() {
            tracing::debug!(request_id = %id, method = %pending.method,
                "Failing pending request");
            let _ = pending.completion.send(Err(make_error()));
        }
        count
    }

    /// The earliest deadline of any pending request
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|pending| pending.deadline.map(|(deadline, _)| deadline))
            .min()
    }

    /// Fail every request whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Id> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline.is_some_and(|(deadline, _)| deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(pending) = self.pending.remove(id) {
                let timeout = pending.deadline.map(|(_, timeout)| timeout).unwrap_or_default();
                tracing::debug!(request_id = %id, method = %pending.method, ?timeout,
                    "Pending request timed out");
                let _ = pending.completion.send(Err(JsonRpcError::RequestTimeout {
                    method: pending.method,
                    timeout,
                }));
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
