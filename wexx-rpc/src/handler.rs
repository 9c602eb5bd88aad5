//! Handlers are the leaves of the dispatch pipeline: the code that actually runs when a method is
//! invoked.
//!
//! Any `async fn` whose arguments all implement [`FromContext`] and whose return type implements
//! [`IntoResponse`] is a [`Handler`].  This is inspired by the way axum turns ordinary async
//! functions into request handlers, simplified because JSON RPC requests are already-decoded JSON
//! and there is no streaming body to consume.
//!
//! ```ignore
//! async fn add(Params(numbers): Params<Vec<i64>>) -> Result<i64, ErrorDetails> {
//!     Ok(numbers.into_iter().sum())
//! }
//!
//! router.add_handler("add", add);
//! ```
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::ConnectionHandle;
use crate::context::Context;
use crate::middleware::{Extension, Middleware, Next};
use crate::types::{ErrorDetails, Id, JsonValue};
use crate::JsonRpcError;

/// Extract a handler argument from the request context.
///
/// Unlike axum there is only one extractor trait; request params are small, already-parsed JSON,
/// so extractors that need them just clone what they use.
pub trait FromContext: Sized {
    /// Why extraction failed.  If this is (or converts from) an [`ErrorDetails`] it is sent to
    /// the caller verbatim, otherwise the caller gets an internal server error.
    type Rejection: Into<anyhow::Error>;

    fn from_context(cx: &Context) -> Result<Self, Self::Rejection>;
}

/// The request params deserialized into `T`.
///
/// Absent params deserialize from `null`, so `Params<Option<T>>` accepts requests without params.
/// Params that do not fit `T` are rejected with an invalid params error.
#[derive(Debug, Clone, PartialEq)]
pub struct Params<T>(pub T);

impl<T: DeserializeOwned> FromContext for Params<T> {
    type Rejection = ErrorDetails;

    fn from_context(cx: &Context) -> Result<Self, Self::Rejection> {
        let params = cx.params().cloned().unwrap_or_default();
        serde_json::from_value(params).map(Params).map_err(|e| {
            ErrorDetails::invalid_params(
                format!("Invalid params for '{}': {e}", cx.method()),
                None,
            )
        })
    }
}

/// The request params exactly as they arrived
#[derive(Debug, Clone, PartialEq)]
pub struct RawParams(pub Option<JsonValue>);

impl FromContext for RawParams {
    type Rejection = Infallible;

    fn from_context(cx: &Context) -> Result<Self, Self::Rejection> {
        Ok(Self(cx.params().cloned()))
    }
}

/// Name of the method being invoked, for handlers registered under several names
#[derive(Debug, Clone, PartialEq)]
pub struct MethodName(pub String);

impl FromContext for MethodName {
    type Rejection = Infallible;

    fn from_context(cx: &Context) -> Result<Self, Self::Rejection> {
        Ok(Self(cx.method().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestId(pub Id);

impl FromContext for RequestId {
    type Rejection = Infallible;

    fn from_context(cx: &Context) -> Result<Self, Self::Rejection> {
        Ok(Self(cx.id().clone()))
    }
}

/// Shared state put in place by the [`Extension`] middleware.
///
/// A missing extension is a bug in how the pipeline was assembled, so the caller gets an internal
/// server error.
impl<T> FromContext for Extension<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Rejection = JsonRpcError;

    fn from_context(cx: &Context) -> Result<Self, Self::Rejection> {
        cx.extensions()
            .get::<T>()
            .cloned()
            .map(Extension)
            .ok_or_else(|| JsonRpcError::Bug {
                message: format!(
                    "Extension of type {} is not present; is the Extension middleware missing?",
                    std::any::type_name::<T>()
                ),
            })
    }
}

/// The connection the request arrived on, for handlers that call back into the remote peer
impl FromContext for ConnectionHandle {
    type Rejection = Infallible;

    fn from_context(cx: &Context) -> Result<Self, Self::Rejection> {
        Ok(cx.connection().clone())
    }
}

/// Anything a handler can return.
///
/// `Ok` values become the result of the response.  Errors become faults in the pipeline, which
/// sends [`ErrorDetails`] verbatim and turns everything else into an internal server error.
pub trait IntoResponse {
    fn into_response(self) -> anyhow::Result<JsonValue>;
}

impl<T, E> IntoResponse for Result<T, E>
where
    T: Serialize,
    E: Into<anyhow::Error>,
{
    fn into_response(self) -> anyhow::Result<JsonValue> {
        let value = self.map_err(Into::<anyhow::Error>::into)?;
        serde_json::to_value(value)
            .map_err(|e| JsonRpcError::SerResponse {
                source: e,
                type_name: std::any::type_name::<T>(),
            })
            .map_err(anyhow::Error::from)
    }
}

impl IntoResponse for JsonValue {
    fn into_response(self) -> anyhow::Result<JsonValue> {
        Ok(self)
    }
}

/// Handlers with nothing to say answer with `null`
impl IntoResponse for () {
    fn into_response(self) -> anyhow::Result<JsonValue> {
        Ok(JsonValue::Null)
    }
}

impl IntoResponse for ErrorDetails {
    fn into_response(self) -> anyhow::Result<JsonValue> {
        Err(self.into())
    }
}

/// A function that can handle a method invocation.
///
/// Implemented for async functions of up to four [`FromContext`] arguments.
///
/// ## Type Parameters
///
/// - `Args`: the tuple of argument types.  It only exists so the blanket impls for functions of
///   different arity don't overlap, and is erased once the handler is turned into middleware.
pub trait Handler<Args>: Clone + Send + Sync + Sized + 'static {
    /// Extract the arguments from `cx` and invoke the handler.
    ///
    /// Extraction happens before the returned future is created, so the future does not borrow
    /// the context.
    fn call(self, cx: &Context) -> BoxFuture<'static, anyhow::Result<JsonValue>>;
}

/// Invoke a macro for all supported tuples of handler arguments.
#[rustfmt::skip]
macro_rules! all_the_tuples {
    ($name:ident) => {
        $name!([]);
        $name!([T1]);
        $name!([T1, T2]);
        $name!([T1, T2, T3]);
        $name!([T1, T2, T3, T4]);
    };
}

macro_rules! impl_handler {
    (
        [$($ty:ident),*]
    ) => {
        #[allow(non_snake_case, unused_variables)]
        impl<F, Fut, Res, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: FnOnce($($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: IntoResponse,
            $( $ty: FromContext + Send + 'static, )*
        {
            fn call(self, cx: &Context) -> BoxFuture<'static, anyhow::Result<JsonValue>> {
                $(
                    let $ty = match $ty::from_context(cx) {
                        Ok(value) => value,
                        Err(rejection) => {
                            let rejection: anyhow::Error = rejection.into();
                            return futures::future::ready(Err(rejection)).boxed();
                        }
                    };
                )*

                async move { self($($ty,)*).await.into_response() }.boxed()
            }
        }
    };
}

all_the_tuples!(impl_handler);

/// Adapts a [`Handler`] into the last link of a middleware chain
struct HandlerMiddleware<H, Args> {
    handler: H,
    _args: PhantomData<fn() -> Args>,
}

#[async_trait]
impl<H, Args> Middleware for HandlerMiddleware<H, Args>
where
    H: Handler<Args>,
    Args: 'static,
{
    async fn handle(&self, cx: &mut Context, _next: Next<'_>) -> anyhow::Result<()> {
        let result = self.handler.clone().call(cx).await?;
        cx.set_result(result)?;
        Ok(())
    }
}

/// Turn a handler into middleware, so it can end a chain registered with [`crate::Router::add`]
pub fn into_middleware<H, Args>(handler: H) -> Arc<dyn Middleware>
where
    H: Handler<Args>,
    Args: 'static,
{
    Arc::new(HandlerMiddleware {
        handler,
        _args: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Outcome;
    use crate::types::Request;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use serde_json::json;

    fn context(params: impl Into<Option<JsonValue>>) -> Context {
        Context::new(
            ConnectionHandle::new_test_handle(),
            Request::new(Id::from("7"), "math.add", params),
        )
    }

    async fn run<H, Args>(handler: H, cx: &mut Context) -> anyhow::Result<()>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        let chain = [into_middleware(handler)];
        Next::new(&chain).run(cx).await
    }

    #[derive(Deserialize)]
    struct Operands {
        a: i64,
        b: i64,
    }

    async fn add(Params(Operands { a, b }): Params<Operands>) -> Result<i64, ErrorDetails> {
        Ok(a + b)
    }

    #[tokio::test]
    async fn params_are_deserialized() {
        let mut cx = context(json!({"a": 2, "b": 3}));
        run(add, &mut cx).await.unwrap();
        assert_eq!(cx.outcome(), &Outcome::Result(json!(5)));
    }

    #[tokio::test]
    async fn bad_params_are_rejected_as_invalid_params() {
        let mut cx = context(json!({"a": "two"}));
        let err = run(add, &mut cx).await.unwrap_err();

        let details = err.downcast_ref::<ErrorDetails>().unwrap();
        assert_eq!(details.code(), -32602);
        assert!(details.message.contains("math.add"));
        assert!(!cx.is_responded());
    }

    #[tokio::test]
    async fn request_metadata_extractors() {
        async fn describe(
            MethodName(method): MethodName,
            RequestId(id): RequestId,
            RawParams(params): RawParams,
        ) -> JsonValue {
            json!({"method": method, "id": id, "params": params})
        }

        let mut cx = context(None);
        run(describe, &mut cx).await.unwrap();
        assert_eq!(
            cx.outcome(),
            &Outcome::Result(json!({"method": "math.add", "id": "7", "params": null}))
        );
    }

    #[tokio::test]
    async fn extension_extractor() {
        #[derive(Clone)]
        struct Greeting(&'static str);

        async fn greet(Extension(greeting): Extension<Greeting>) -> Result<String, anyhow::Error> {
            Ok(greeting.0.to_string())
        }

        let mut cx = context(None);
        let err = run(greet, &mut cx).await.unwrap_err();
        assert_matches!(err.downcast_ref::<JsonRpcError>(), Some(JsonRpcError::Bug { .. }));

        let mut cx = context(None);
        cx.extensions_mut().insert(Greeting("hello"));
        run(greet, &mut cx).await.unwrap();
        assert_eq!(cx.outcome(), &Outcome::Result(json!("hello")));
    }

    #[tokio::test]
    async fn unit_and_error_details_responses() {
        async fn nothing() {}
        async fn refuse() -> ErrorDetails {
            ErrorDetails::server_error(-32001, "nope", json!({"why": "because"}))
        }

        let mut cx = context(None);
        run(nothing, &mut cx).await.unwrap();
        assert_eq!(cx.outcome(), &Outcome::Result(JsonValue::Null));

        let mut cx = context(None);
        let err = run(refuse, &mut cx).await.unwrap_err();
        assert_eq!(err.downcast_ref::<ErrorDetails>().unwrap().code(), -32001);
    }
}
