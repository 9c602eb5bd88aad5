//! A live connection to a remote peer over one transport.
//!
//! Each connection is serviced by a dedicated event loop task (see `event_loop`) which exclusively
//! owns the transport, the outbound request tracker, and the heartbeat timer.  Everything else
//! talks to it through a cheaply-clonable [`ConnectionHandle`], and observes it through
//! [`ConnectionEvents`].
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{FutureExt, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::dispatch::Dispatch;
use crate::protocol::Inbound;
use crate::{error, transport, types};

mod event_loop;
mod handle;

pub use handle::{ConnectionHandle, PendingResponse};

/// After this many messages are queued for the event loop and not yet transmitted, backpressure is
/// excerted on the senders
pub(crate) const CONNECTION_CHANNEL_BOUNDS: usize = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How often to probe the remote peer for liveness.  A peer that is silent for two
    /// consecutive intervals is considered dead and the connection is closed.
    ///
    /// `None` or a zero interval disables the heartbeat.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Option<Duration>,

    /// How long an outbound request may wait for its response before failing with
    /// [`crate::JsonRpcError::RequestTimeout`].
    ///
    /// `None` (the default) waits until the response arrives or the connection closes.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,

    /// The amount of time after the connection starts shutting down to wait for any in-flight
    /// inbound requests to complete before aborting them.
    ///
    /// `None` indicates no limit, which is probably not a good idea.
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(30)),
            request_timeout: None,
            graceful_shutdown_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Why a connection closed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed from this side, either explicitly or because every handle was dropped
    Local,
    /// The remote peer closed the transport
    PeerClosed,
    /// The transport failed
    TransportError(String),
    /// The remote peer stopped answering liveness probes
    HeartbeatTimeout,
}

/// Asynchronous errors surfaced by a connection
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionError {
    /// The remote peer sent an error not tied to any request
    Remote(types::ErrorDetails),
    /// The transport reported an error
    Transport(String),
}

/// Things that happen on a connection, in the order the transport delivered them
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// Every successfully classified inbound message
    Message(Inbound),
    /// A notification from the remote peer.  Liveness probes are not included.
    Notification(types::Notification),
    Error(ConnectionError),
    /// Emitted exactly once, after every pending request has been failed
    Close(CloseReason),
}

/// Receiving end of a connection's events.
///
/// Events are buffered without limit until they are received, so that [`ConnectionEvent::Close`]
/// is never lost.  Either keep receiving them or drop this value, in which case later events are
/// discarded.  Holding on to it without reading grows the buffer for as long as the connection
/// lives.
pub struct ConnectionEvents {
    receiver: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEvents {
    /// The next event, or `None` once the connection has closed and every event was received
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.receiver.recv().await
    }
}

impl Stream for ConnectionEvents {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Start servicing a transport, returning a handle to the connection and its event stream.
///
/// Inbound requests are handed to `dispatcher`; without one they are answered with an unhandled
/// request error.
///
/// The event loop is spawned with [`tokio::spawn`] so this must be called inside a tokio runtime.
/// It runs until the connection is closed from either side, or until every [`ConnectionHandle`]
/// has been dropped.
pub fn spawn(
    transport: impl transport::Transport,
    config: ConnectionConfig,
    dispatcher: Option<Arc<dyn Dispatch>>,
) -> (ConnectionHandle, ConnectionEvents) {
    let peer = transport::Peer::new(transport);
    let span = peer.span();

    let (outbound_tx, outbound_rx) = mpsc::channel(CONNECTION_CHANNEL_BOUNDS);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let close_token = CancellationToken::new();
    let done = CancellationToken::new();

    let handle = ConnectionHandle::new(outbound_tx.clone(), close_token.clone(), done.clone());

    let event_loop = event_loop::ConnectionLoop::new(
        config,
        peer,
        dispatcher,
        outbound_rx,
        outbound_tx.downgrade(),
        close_token,
        done.clone(),
        events_tx,
    );
    drop(outbound_tx);

    tokio::spawn(
        async move {
            // The loop cancels `done` on every normal exit; a panic skips that
            if let Err(e) = AssertUnwindSafe(event_loop.run()).catch_unwind().await {
                tracing::error!(panic = %error::panic_err_to_string(e), "Connection event loop panicked");
                done.cancel();
            }
        }
        .instrument(span),
    );

    (handle, ConnectionEvents { receiver: events_rx })
}
