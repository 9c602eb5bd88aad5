//! The server side composition root: one dispatch pipeline shared by every accepted connection.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};

use crate::connection::{self, ConnectionConfig, ConnectionEvents, ConnectionHandle};
use crate::dispatch::{Dispatch, Pipeline};
use crate::middleware::{self, Middleware};
use crate::router::Router;
use crate::transport::Transport;
use crate::types::JsonValue;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Send the details of internal errors (handler failures and panics) to the remote peer.
    ///
    /// Off by default, in which case the peer only learns that an internal error happened.  Turn
    /// it on in development.
    pub expose_internal_errors: bool,

    /// Settings for every connection the application accepts
    pub connection: ConnectionConfig,
}

/// Assembles an [`Application`] from config and the middleware chain.
///
/// Middleware runs in the order it was added.  Requests that fall off the end of the chain get an
/// unhandled request error.
#[derive(Default)]
pub struct ApplicationBuilder {
    config: ApplicationConfig,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl ApplicationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ApplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a middleware to the chain
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(middleware::layer(middleware));
        self
    }

    /// Append a router to the chain
    pub fn with_router(self, router: Router) -> Self {
        self.with_middleware(router)
    }

    /// Make a clone of `value` available to every request.
    ///
    /// Handlers get at it with the `Extension<T>` extractor.
    pub fn with_extension<T: Clone + Send + Sync + 'static>(self, value: T) -> Self {
        self.with_middleware(middleware::Extension(value))
    }

    pub fn build(self) -> Application {
        let pipeline =
            Pipeline::new(self.middleware).with_expose_internal_errors(self.config.expose_internal_errors);

        Application {
            inner: Arc::new(ApplicationInner {
                config: self.config,
                pipeline,
                next_client_id: AtomicU64::new(1),
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Serves any number of connections with one dispatch pipeline, and keeps track of them so they
/// can all be notified at once.
///
/// Cheap to clone; clones share the same registry of clients.
#[derive(Clone)]
pub struct Application {
    inner: Arc<ApplicationInner>,
}

struct ApplicationInner {
    config: ApplicationConfig,
    pipeline: Pipeline,
    next_client_id: AtomicU64,
    clients: Mutex<HashMap<u64, ConnectionHandle>>,
}

impl ApplicationInner {
    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnectionHandle>> {
        // The map is always left consistent, so a panic elsewhere while holding the lock is no
        // reason to stop using it
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.inner.config
    }

    /// Start serving a newly accepted transport.
    ///
    /// The connection is registered as a client until it closes.  The application keeps a handle
    /// to it, so it stays open until either side closes it.  Drop the returned events if nothing
    /// is going to read them.
    pub fn accept(&self, transport: impl Transport) -> (ConnectionHandle, ConnectionEvents) {
        let (handle, events) =
            connection::spawn(transport, self.inner.config.connection.clone(), Some(self.dispatcher()));

        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.inner.clients().insert(client_id, handle.clone());
        tracing::info!(client_id, "Accepted client");

        let registry = Arc::downgrade(&self.inner);
        let closed = handle.clone();
        tokio::spawn(async move {
            closed.closed().await;
            Self::forget_client(registry, client_id);
        });

        (handle, events)
    }

    fn forget_client(registry: Weak<ApplicationInner>, client_id: u64) {
        if let Some(inner) = registry.upgrade() {
            inner.clients().remove(&client_id);
            tracing::info!(client_id, "Client disconnected");
        }
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.inner.clients().len()
    }

    /// Send a notification to every connected client.
    ///
    /// Failures to reach individual clients are logged and otherwise ignored.  Returns how many
    /// clients the notification was sent to.
    pub async fn notify_all(&self, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> usize {
        let method = method.into();
        let params = params.into();
        let clients: Vec<(u64, ConnectionHandle)> = self
            .inner
            .clients()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        let sends = clients.into_iter().map(|(client_id, handle)| {
            let method = method.clone();
            let params = params.clone();
            async move {
                match handle.notify(method, params).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(client_id, err = %e, "Failed to notify client");
                        false
                    }
                }
            }
        });

        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count()
    }

    /// Close every connected client and wait for them to finish closing
    pub async fn close(&self) {
        let clients: Vec<ConnectionHandle> = self.inner.clients().values().cloned().collect();
        futures::future::join_all(clients.iter().map(|handle| handle.close())).await;
    }

    /// The dispatch pipeline, for use on connections the application did not accept itself
    pub fn dispatcher(&self) -> Arc<dyn Dispatch> {
        Arc::new(self.inner.pipeline.clone())
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("config", &self.inner.config)
            .field("pipeline", &self.inner.pipeline)
            .field("clients", &self.client_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Params;
    use crate::testing::{init_test_logging, setup_raw_peer};
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Condition not met in time");
    }

    #[test]
    fn config_from_yaml() {
        let config: ApplicationConfig = serde_yaml::from_str(
            r#"
expose_internal_errors: true
connection:
  heartbeat_interval: 10s
  request_timeout: 1m 30s
"#,
        )
        .unwrap();

        assert!(config.expose_internal_errors);
        assert_eq!(config.connection.heartbeat_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.connection.request_timeout, Some(Duration::from_secs(90)));
        assert_eq!(
            config.connection.graceful_shutdown_timeout,
            ConnectionConfig::default().graceful_shutdown_timeout
        );

        let config: ApplicationConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ApplicationConfig::default());
    }

    #[tokio::test]
    async fn accepted_client_is_served() {
        init_test_logging();
        async fn add(Params(numbers): Params<Vec<i64>>) -> Result<i64, anyhow::Error> {
            Ok(numbers.into_iter().sum())
        }

        let app = Application::builder()
            .with_router(Router::new().with_handler("add", add))
            .build();
        let (transport, mut peer) = setup_raw_peer();
        let (_handle, _events) = app.accept(transport);

        peer.send(r#"{"jsonrpc":"2.0","id":"a","method":"add","params":[1,2,3]}"#).await;
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"jsonrpc": "2.0", "id": "a", "result": 6})
        );
    }

    #[tokio::test]
    async fn notify_all_and_registry_cleanup() {
        init_test_logging();
        let app = Application::builder().build();

        let (transport_a, mut peer_a) = setup_raw_peer();
        let (transport_b, mut peer_b) = setup_raw_peer();
        let (handle_a, _events_a) = app.accept(transport_a);
        let (_handle_b, _events_b) = app.accept(transport_b);
        assert_eq!(app.client_count(), 2);

        assert_eq!(app.notify_all("announce", json!({"text": "hello"})).await, 2);
        let expected = json!({"jsonrpc": "2.0", "method": "announce", "params": {"text": "hello"}});
        assert_eq!(peer_a.recv_json().await.unwrap(), expected);
        assert_eq!(peer_b.recv_json().await.unwrap(), expected);

        // Peer A hangs up
        drop(peer_a);
        handle_a.closed().await;
        wait_for(|| app.client_count() == 1).await;

        assert_eq!(app.notify_all("announce", None).await, 1);
        assert_eq!(
            peer_b.recv_json().await.unwrap(),
            json!({"jsonrpc": "2.0", "method": "announce"})
        );

        app.close().await;
        wait_for(|| app.client_count() == 0).await;
    }
}
