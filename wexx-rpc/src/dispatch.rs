//! Turning an inbound request into (at most) one response.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::connection::ConnectionHandle;
use crate::context::{Context, Outcome};
use crate::error;
use crate::middleware::{Middleware, Next};
use crate::types::{self, ErrorDetails};

/// Message sent in place of the details of an internal error when those are not exposed
const REDACTED_INTERNAL_ERROR: &str = "Internal server error";

/// What a connection hands its inbound requests to.
///
/// The returned future runs in its own task.  It resolves to the response to send, or `None` if
/// no response should be sent at all.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        connection: ConnectionHandle,
        request: types::Request,
    ) -> BoxFuture<'static, Option<types::Response>>;
}

/// A middleware chain wrapped so that every request gets exactly one response.
///
/// - A request nothing in the chain answered gets an unhandled request error.
/// - A fault (an error returned from the chain, or a panic) is caught here, logged, and turned
///   into an internal server error.  Its details are only sent to the caller when
///   `expose_internal_errors` is set.
/// - An [`ErrorDetails`] returned as an error is not a fault; it goes to the caller verbatim.
/// - A fault after the request was already answered is logged and the answer stands.
#[derive(Clone)]
pub struct Pipeline {
    middleware: Arc<[Arc<dyn Middleware>]>,
    expose_internal_errors: bool,
}

impl Pipeline {
    pub fn new(middleware: impl IntoIterator<Item = Arc<dyn Middleware>>) -> Self {
        Self {
            middleware: middleware.into_iter().collect(),
            expose_internal_errors: false,
        }
    }

    pub fn with_expose_internal_errors(mut self, expose: bool) -> Self {
        self.expose_internal_errors = expose;
        self
    }

    /// Run one request through the chain
    pub async fn run(&self, connection: ConnectionHandle, request: types::Request) -> Option<types::Response> {
        let mut cx = Context::new(connection, request);

        let fault = match AssertUnwindSafe(Next::new(&self.middleware).run(&mut cx))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Fault::Error(e)),
            Err(panic) => Some(Fault::Panic(error::panic_err_to_string(panic))),
        };

        let elapsed = cx.elapsed();
        let (request, outcome) = cx.into_parts();

        let outcome = match fault {
            None => outcome,
            Some(fault) if outcome == Outcome::Pending => Outcome::Error(self.fault_to_error(&request, fault)),
            Some(fault) => {
                tracing::warn!(request_id = %request.id, method = %request.method, %fault,
                    "Request failed after it was already answered; keeping the answer");
                outcome
            }
        };

        tracing::debug!(request_id = %request.id, method = %request.method, ?elapsed, ?outcome,
            "Request dispatched");

        match outcome {
            Outcome::Pending => {
                tracing::debug!(request_id = %request.id, method = %request.method,
                    "Nothing handled the request");
                Some(types::Response::error_detail(
                    request.id,
                    ErrorDetails::unhandled_request(&request.method),
                ))
            }
            Outcome::Result(result) => Some(types::Response::success(request.id, result)),
            Outcome::Error(error) => Some(types::Response::error_detail(request.id, error)),
            Outcome::Suppressed => None,
        }
    }

    fn fault_to_error(&self, request: &types::Request, fault: Fault) -> ErrorDetails {
        if let Fault::Error(e) = &fault {
            if let Some(details) = e.downcast_ref::<ErrorDetails>() {
                tracing::debug!(request_id = %request.id, method = %request.method, error = %details,
                    "Request failed with an application error");
                return details.clone();
            }
        }

        tracing::error!(request_id = %request.id, method = %request.method, %fault,
            "Internal error handling request");

        if self.expose_internal_errors {
            ErrorDetails::internal_error(fault.to_string(), None)
        } else {
            ErrorDetails::internal_error(REDACTED_INTERNAL_ERROR, None)
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("middleware", &self.middleware.len())
            .field("expose_internal_errors", &self.expose_internal_errors)
            .finish()
    }
}

impl Dispatch for Pipeline {
    fn dispatch(
        &self,
        connection: ConnectionHandle,
        request: types::Request,
    ) -> BoxFuture<'static, Option<types::Response>> {
        let pipeline = self.clone();
        async move { pipeline.run(connection, request).await }.boxed()
    }
}

enum Fault {
    Error(anyhow::Error),
    Panic(String),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Error(e) => write!(f, "{e:#}"),
            Fault::Panic(message) => write!(f, "panic: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::layer;
    use crate::router::Router;
    use crate::types::{Id, JsonValue, ResponsePayload};
    use async_trait::async_trait;
    use serde_json::json;

    /// Answers, then fails anyway
    struct AnswerThenFail;

    #[async_trait]
    impl Middleware for AnswerThenFail {
        async fn handle(&self, cx: &mut Context, _next: Next<'_>) -> anyhow::Result<()> {
            cx.set_result(json!("first"))?;
            anyhow::bail!("something broke afterwards")
        }
    }

    /// Answers, then lets the rest of the chain try to answer too
    struct AnswerEarly;

    #[async_trait]
    impl Middleware for AnswerEarly {
        async fn handle(&self, cx: &mut Context, next: Next<'_>) -> anyhow::Result<()> {
            cx.set_result(json!("early"))?;
            next.run(cx).await
        }
    }

    struct Suppress;

    #[async_trait]
    impl Middleware for Suppress {
        async fn handle(&self, cx: &mut Context, _next: Next<'_>) -> anyhow::Result<()> {
            cx.suppress()?;
            Ok(())
        }
    }

    async fn add(crate::handler::Params(numbers): crate::handler::Params<Vec<i64>>) -> Result<i64, ErrorDetails> {
        Ok(numbers.into_iter().sum())
    }

    async fn explode() -> JsonValue {
        panic!("kaboom")
    }

    async fn fail() -> Result<(), anyhow::Error> {
        anyhow::bail!("database password is hunter2")
    }

    async fn refuse() -> Result<(), ErrorDetails> {
        Err(ErrorDetails::server_error(-32042, "Not allowed", json!({"reason": "testing"})))
    }

    fn router() -> Router {
        Router::new()
            .with_handler("add", add)
            .with_handler("explode", explode)
            .with_handler("fail", fail)
            .with_handler("refuse", refuse)
    }

    async fn call(pipeline: &Pipeline, method: &str, params: JsonValue) -> Option<types::Response> {
        crate::testing::init_test_logging();
        pipeline
            .run(
                ConnectionHandle::new_test_handle(),
                types::Request::new(Id::from("1"), method, params),
            )
            .await
    }

    fn error_of(response: Option<types::Response>) -> ErrorDetails {
        match response.map(|r| r.payload) {
            Some(ResponsePayload::Error(e)) => e.error,
            other => panic!("Expected an error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handled_request_gets_one_response() {
        let pipeline = Pipeline::new([layer(router())]);
        let response = call(&pipeline, "add", json!([1, 2, 3])).await.unwrap();
        assert_eq!(response.id, Id::from("1"));
        assert_eq!(response.payload, ResponsePayload::success(json!(6)));
    }

    #[tokio::test]
    async fn unhandled_request() {
        let pipeline = Pipeline::new([layer(router())]);
        let error = error_of(call(&pipeline, "subtract", json!([1])).await);
        assert_eq!(error.code(), -32601);
        assert_eq!(error.message, "Unhandled request: subtract");
    }

    #[tokio::test]
    async fn panic_is_redacted_internal_error() {
        let pipeline = Pipeline::new([layer(router())]);
        let error = error_of(call(&pipeline, "explode", json!({})).await);
        assert_eq!(error.code(), -32603);
        assert_eq!(error.message, REDACTED_INTERNAL_ERROR);

        let error = error_of(call(&pipeline, "fail", json!({})).await);
        assert_eq!(error.code(), -32603);
        assert!(!error.message.contains("hunter2"));
    }

    #[tokio::test]
    async fn internal_errors_exposed_when_configured() {
        let pipeline = Pipeline::new([layer(router())]).with_expose_internal_errors(true);

        let error = error_of(call(&pipeline, "explode", json!({})).await);
        assert_eq!(error.code(), -32603);
        assert!(error.message.contains("kaboom"), "{}", error.message);

        let error = error_of(call(&pipeline, "fail", json!({})).await);
        assert!(error.message.contains("hunter2"), "{}", error.message);
    }

    #[tokio::test]
    async fn application_errors_are_verbatim() {
        let pipeline = Pipeline::new([layer(router())]);
        let error = error_of(call(&pipeline, "refuse", json!({})).await);
        assert_eq!(
            error,
            ErrorDetails::server_error(-32042, "Not allowed", json!({"reason": "testing"}))
        );
    }

    #[tokio::test]
    async fn suppressed_request_gets_no_response() {
        let pipeline = Pipeline::new([layer(Suppress), layer(router())]);
        assert_eq!(call(&pipeline, "add", json!([1])).await, None);
    }

    #[tokio::test]
    async fn first_answer_stands() {
        let pipeline = Pipeline::new([layer(AnswerThenFail)]);
        let response = call(&pipeline, "anything", json!({})).await.unwrap();
        assert_eq!(response.payload, ResponsePayload::success(json!("first")));

        let pipeline = Pipeline::new([layer(AnswerEarly), layer(router())]);
        let response = call(&pipeline, "add", json!([1, 2])).await.unwrap();
        assert_eq!(response.payload, ResponsePayload::success(json!("early")));
    }
}
