//! Handle to a connection event loop and related types.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::event_loop::OutboundMessage;
use crate::{JsonRpcError, Result, protocol, types};

/// Lightweight and cheaply-clonable handle to a connection and its associated background task.
///
/// This handle is used to send requests and notifications to the remote peer at the other end of
/// the connection.  It is also able to close the connection.
///
/// Handlers running in the dispatch pipeline get a handle to the connection the request arrived
/// on, so they can call back into the remote peer.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound_messages: mpsc::Sender<OutboundMessage>,
    close_token: CancellationToken,
    done: CancellationToken,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub(super) fn new(
        outbound_messages: mpsc::Sender<OutboundMessage>,
        close_token: CancellationToken,
        done: CancellationToken,
    ) -> Self {
        Self {
            outbound_messages,
            close_token,
            done,
        }
    }

    /// Create a handle that is not connected to anything, for tests that need one in order to
    /// construct a request context.  Everything sent through it fails with `Disposed`.
    #[cfg(test)]
    pub(crate) fn new_test_handle() -> Self {
        let (tx, _rx) = mpsc::channel(super::CONNECTION_CHANNEL_BOUNDS);
        let done = CancellationToken::new();
        done.cancel();
        Self::new(tx, CancellationToken::new(), done)
    }

    /// Close the connection and wait until its event loop has finished.
    ///
    /// This affects every other handle to the same connection.  Outbound requests that are still
    /// waiting for a response fail with [`JsonRpcError::ConnectionClosed`].  Inbound requests still
    /// being handled get the configurable graceful shutdown timeout to finish, after which they
    /// are aborted.
    ///
    /// Once the close is requested the shutdown proceeds whether or not this future is polled to
    /// completion.
    pub async fn close(&self) {
        self.close_token.cancel();
        self.closed().await;
    }

    /// Wait until the connection has closed, for whatever reason
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Whether the connection's event loop has finished
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Send a message to the remote peer as-is.
    ///
    /// Completes once the transport has accepted the message.  A request sent this way is not
    /// tracked, so its response is only visible as a [`super::ConnectionEvent::Message`]; use
    /// [`Self::request`] to wait for a response.
    pub async fn send(&self, message: impl Into<types::Message>) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        if self
            .outbound_messages
            .send(OutboundMessage::Message {
                message: message.into(),
                send_confirmation_tx: tx,
            })
            .await
            .is_err()
        {
            tracing::debug!(
                "Outbound messages channel closed when trying to send message; connection is presumably \
                 closed"
            );
            return Err(JsonRpcError::Disposed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("BUG: One-shot channel was dropped before the event loop could confirm a send");
                Err(JsonRpcError::Disposed)
            }
        }
    }

    /// Send a notification to the remote peer, neither expecting nor waiting for a response.
    ///
    /// A successful completion of this call merely means that the notification message was formed
    /// and written over the wire successfully.
    ///
    /// Params must be an object or an array; anything else fails with
    /// [`JsonRpcError::InvalidParams`] without sending.
    #[instrument(skip_all, fields(method))]
    pub async fn notify(&self, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Result<()> {
        let method = method.into();
        let params = protocol::outbound_params(&method, params.into())?;
        self.send(types::Notification::new(method, params)).await
    }

    /// Send a notification with parameters serialized from any [`Serialize`] type
    pub async fn notify_with_params<Req>(&self, method: impl Into<String>, params: Req) -> Result<()>
    where
        Req: Serialize,
    {
        let params = serialize_params(params)?;
        self.notify(method, params).await
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with [`JsonRpcError::Application`] if the remote peer answers with an error, or
    /// [`JsonRpcError::ConnectionClosed`] if the connection closes first.
    pub async fn request(&self, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Result<JsonValue> {
        self.start_request(method, params).await?.await
    }

    /// Send a request without waiting for the response.
    ///
    /// The returned [`PendingResponse`] is a future that resolves to the response.  Dropping it
    /// abandons the request; the response will be discarded when it arrives.
    ///
    /// Params must be an object or an array; anything else fails with
    /// [`JsonRpcError::InvalidParams`] without sending.
    #[instrument(skip_all, fields(method))]
    pub async fn start_request(
        &self,
        method: impl Into<String>,
        params: impl Into<Option<JsonValue>>,
    ) -> Result<PendingResponse> {
        let method = method.into();
        let params = protocol::outbound_params(&method, params.into())?;
        let (tx, rx) = oneshot::channel();

        if self
            .outbound_messages
            .send(OutboundMessage::Request {
                method: method.clone(),
                params,
                response_tx: tx,
            })
            .await
            .is_err()
        {
            tracing::debug!(
                %method,
                "Outbound messages channel closed when trying to send request; connection is presumably \
                 closed"
            );
            return Err(JsonRpcError::ConnectionClosed);
        }

        Ok(PendingResponse { receiver: rx, method })
    }

    /// Invoke a method without any parameters, deserializing the response
    pub async fn call<Resp>(&self, method: impl Into<String>) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let result = self.request(method, None).await?;
        protocol::decode_result(result)
    }

    /// Invoke a method with parameters, deserializing the response
    pub async fn call_with_params<Req, Resp>(&self, method: impl Into<String>, params: Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params = serialize_params(params)?;
        let result = self.request(method, params).await?;
        protocol::decode_result(result)
    }
}

fn serialize_params<Req: Serialize>(params: Req) -> Result<JsonValue> {
    serde_json::to_value(params).map_err(|e| JsonRpcError::SerRequest {
        source: e,
        type_name: std::any::type_name::<Req>(),
    })
}

/// A request that has been handed to the connection and is waiting for its response.
///
/// Obtained from [`ConnectionHandle::start_request`].
#[pin_project]
pub struct PendingResponse {
    #[pin]
    receiver: oneshot::Receiver<Result<JsonValue>>,
    method: String,
}

impl PendingResponse {
    /// The method this request invoked
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for PendingResponse {
    type Output = Result<JsonValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match futures::ready!(this.receiver.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => {
                // The event loop drains every pending request when it exits, so this only
                // happens if it panicked
                tracing::error!(
                    method = %this.method,
                    "BUG: One-shot channel was dropped before the event loop could send a response"
                );
                Poll::Ready(Err(JsonRpcError::ConnectionClosed))
            }
        }
    }
}
