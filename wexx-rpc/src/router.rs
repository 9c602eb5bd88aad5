//! After an inbound request has been decoded, it needs to be routed to whatever handles its
//! method.  The logic to perform this is called "routing", and is implemented in the [`Router`]
//! type in this module.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::handler::{self, Handler};
use crate::middleware::{Middleware, Next};

/// Router inspired loosely by the `axum` crate router, but simplified and specialized for
/// JSON-RPC: requests are routed on the method name alone.
///
/// A router is middleware.  When the method has a route, its chain runs, and if that chain falls
/// off the end without answering, the pipeline continues after the router.  Requests for methods
/// with no route pass straight through, so several routers can be stacked and whatever comes last
/// in the pipeline sees everything none of them claimed.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Arc<[Arc<dyn Middleware>]>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the chain of middleware that handles `method`.
    ///
    /// Registering the same method again replaces the previous chain.
    pub fn add(&mut self, method: impl Into<String>, chain: impl IntoIterator<Item = Arc<dyn Middleware>>) -> &mut Self {
        let method = method.into();
        let chain: Arc<[Arc<dyn Middleware>]> = chain.into_iter().collect();

        if self.routes.insert(method.clone(), chain).is_some() {
            tracing::debug!(%method, "Replacing existing route");
        }
        self
    }

    /// Register a single handler function for `method`
    pub fn add_handler<H, Args>(&mut self, method: impl Into<String>, handler: H) -> &mut Self
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.add(method, [handler::into_middleware(handler)])
    }

    /// Builder-style variant of [`Self::add_handler`]
    pub fn with_handler<H, Args>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.add_handler(method, handler);
        self
    }

    pub fn has_route(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    /// Names of the routed methods, in no particular order
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Middleware for Router {
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> anyhow::Result<()> {
        match self.routes.get(cx.method()).cloned() {
            Some(chain) => Next::nested(&chain, &next).run(cx).await,
            None => next.run(cx).await,
        }
    }
}
