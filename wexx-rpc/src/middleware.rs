//! Middleware is the unit of composition in the dispatch pipeline.
//!
//! Each inbound request runs through an ordered chain of [`Middleware`].  Every link receives the
//! request [`Context`] and a [`Next`] continuation; it can answer the request itself, do something
//! before or after the rest of the chain by calling [`Next::run`], or do both.  A [`crate::Router`]
//! is itself middleware that picks a chain by method name.
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::Context;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Process a request.
    ///
    /// Returning an error reports a fault.  If the error is (or wraps) a
    /// [`crate::ErrorDetails`] it is sent to the caller verbatim; anything else becomes an
    /// internal server error.
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> anyhow::Result<()>;
}

#[async_trait]
impl<M: Middleware> Middleware for Arc<M> {
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> anyhow::Result<()> {
        (**self).handle(cx, next).await
    }
}

/// The remainder of a middleware chain.
///
/// When a chain nested inside another one (such as a route inside a router) runs out, the outer
/// chain continues where it left off.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    rest: Option<&'a Next<'a>>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain, rest: None }
    }

    /// Run `chain`, continuing with `rest` once it is exhausted
    pub(crate) fn nested(chain: &'a [Arc<dyn Middleware>], rest: &'a Next<'a>) -> Self {
        Self {
            chain,
            rest: Some(rest),
        }
    }

    /// Run the rest of the chain.
    ///
    /// Once every link has run, control returns to the caller; if nothing answered the request
    /// the pipeline reports it as unhandled.
    pub fn run<'b>(self, cx: &'b mut Context) -> BoxFuture<'b, anyhow::Result<()>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((first, chain)) => {
                    first
                        .handle(
                            cx,
                            Next {
                                chain,
                                rest: self.rest,
                            },
                        )
                        .await
                }
                None => match self.rest {
                    Some(rest) => (*rest).run(cx).await,
                    None => Ok(()),
                },
            }
        })
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.chain.len())
            .field("nested", &self.rest.is_some())
            .finish()
    }
}

/// Middleware that makes a clone of some shared value available to every request.
///
/// Handlers get it back by taking an `Extension<T>` argument, or through [`Context::extensions`].
#[derive(Clone, Debug)]
pub struct Extension<T>(pub T);

#[async_trait]
impl<T> Middleware for Extension<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> anyhow::Result<()> {
        cx.extensions_mut().insert(self.0.clone());
        next.run(cx).await
    }
}

/// Wrap a middleware so it can be put in a chain
pub fn layer(middleware: impl Middleware) -> Arc<dyn Middleware> {
    Arc::new(middleware)
}
