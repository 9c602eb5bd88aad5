//! The client side composition root: a reconnecting connection with typed helpers.
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::application::Application;
use crate::connection::ConnectionHandle;
use crate::retry::{ConnectionState, RetryConfig, RetryConnection, RetryEvents};
use crate::router::Router;
use crate::transport::Connector;
use crate::Result;

/// Configures a [`Client`].
///
/// A client can serve methods of its own, which the server invokes over the same connection, by
/// giving it an [`Application`] or a [`Router`].
#[derive(Default)]
pub struct ClientBuilder {
    config: RetryConfig,
    application: Option<Application>,
}

impl ClientBuilder {
    pub fn with_config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve requests from the server with `application`'s pipeline
    pub fn with_application(mut self, application: Application) -> Self {
        self.application = Some(application);
        self
    }

    /// Serve requests from the server with `router`, and nothing else
    pub fn with_router(self, router: Router) -> Self {
        self.with_application(Application::builder().with_router(router).build())
    }

    /// Start connecting with `connector`.
    ///
    /// Returns immediately; use [`Client::opened`] to wait for the connection.  The events include
    /// every notification the server sends.
    pub fn connect<C: Connector>(self, connector: C) -> Result<(Client, RetryEvents)> {
        let dispatcher = self.application.as_ref().map(Application::dispatcher);
        let (connection, events) = RetryConnection::new(connector, self.config, dispatcher);
        connection.connect()?;

        Ok((Client { connection }, events))
    }
}

/// A JSON RPC client that keeps itself connected.
///
/// Calls made while the client is between connections fail with
/// [`crate::JsonRpcError::NotConnected`].
#[derive(Clone, Debug)]
pub struct Client {
    connection: RetryConnection,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The underlying reconnecting connection
    pub fn retry_connection(&self) -> &RetryConnection {
        &self.connection
    }

    /// Wait until connected
    pub async fn opened(&self) -> Result<ConnectionHandle> {
        self.connection.opened().await
    }

    pub async fn call<Resp>(&self, method: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        self.connection.call(method).await
    }

    pub async fn call_with_params<Req, Resp>(&self, method: &str, params: Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.connection.call_with_params(method, params).await
    }

    pub async fn notify(&self, method: &str) -> Result<()> {
        self.connection.notify(method, None).await
    }

    pub async fn notify_with_params<Req>(&self, method: &str, params: Req) -> Result<()>
    where
        Req: Serialize,
    {
        self.connection.notify_with_params(method, params).await
    }

    /// Disconnect and stop reconnecting
    pub async fn close(&self) {
        self.connection.close().await
    }
}
