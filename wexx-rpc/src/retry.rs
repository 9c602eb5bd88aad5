//! A connection that reconnects by itself.
//!
//! [`RetryConnection`] drives a small state machine around successive [`crate::connection`]s,
//! each made from a fresh transport produced by a [`Connector`]:
//!
//! ```text
//!            connect()                success
//!   CLOSED ------------> CONNECTING ----------> OPEN
//!     ^  |                    |                   |
//!     |  | retry              | failure           | close / error
//!     |  v                    v                   v
//!   WAITING <----------- CLOSED <------------- CLOSED
//! ```
//!
//! The machine is run by a supervisor task.  It stops when [`RetryConnection::close`] is called or
//! when the last handle is dropped.
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{FutureExt, Stream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::connection::{
    self, CloseReason, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionHandle,
};
use crate::dispatch::Dispatch;
use crate::transport::Connector;
use crate::types::{self, JsonValue};
use crate::{JsonRpcError, Result, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected.  The initial state, and the state after any failure.
    Closed,
    /// A transport is being established
    Connecting,
    /// Waiting out the retry interval
    Waiting,
    /// Connected; the only state in which requests and notifications can be sent
    Open,
}

impl ConnectionState {
    /// Whether the state machine has an edge from `self` to `to`
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, to),
            (Closed, Connecting)
                | (Closed, Waiting)
                | (Connecting, Open)
                | (Connecting, Closed)
                | (Waiting, Closed)
                | (Open, Closed)
        )
    }

    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(JsonRpcError::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Waiting => "WAITING",
            ConnectionState::Open => "OPEN",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// How long to wait before reconnecting
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// If set, the wait doubles after each consecutive failure, up to this much.  It goes back to
    /// `interval` once a connection opens.
    #[serde(with = "humantime_serde")]
    pub max_interval: Option<Duration>,

    /// Settings for each connection the machine opens
    pub connection: ConnectionConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_interval: None,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Things that happen to a [`RetryConnection`]
#[derive(Clone, Debug, PartialEq)]
pub enum RetryEvent {
    /// The machine moved to a new state
    State(ConnectionState),
    /// A connection was established
    Open,
    /// Establishing a connection failed
    ConnectError(String),
    /// The open connection closed
    Close(CloseReason),
    /// Notification from the remote peer on the open connection
    Notification(types::Notification),
    /// Error surfaced by the open connection
    Error(ConnectionError),
}

/// Receiving end of a [`RetryConnection`]'s events.  Ends once the machine has stopped.
///
/// Like [`crate::ConnectionEvents`] the buffer is unbounded: receive the events or drop this value,
/// don't keep it around unread.
pub struct RetryEvents {
    receiver: mpsc::UnboundedReceiver<RetryEvent>,
}

impl RetryEvents {
    pub async fn recv(&mut self) -> Option<RetryEvent> {
        self.receiver.recv().await
    }
}

impl Stream for RetryEvents {
    type Item = RetryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// What the supervisor publishes to the handles
#[derive(Clone)]
struct Link {
    state: ConnectionState,
    /// Set exactly when the state is `Open`
    connection: Option<ConnectionHandle>,
}

struct Shared {
    link: watch::Receiver<Link>,
    connect_requested: watch::Sender<bool>,
    stop: CancellationToken,
    finished: CancellationToken,
    /// Stops the supervisor once the last handle is gone
    _drop_guard: DropGuard,
}

/// Handle to a self-healing connection.
///
/// Cheap to clone.  Requests and notifications fail immediately with
/// [`JsonRpcError::NotConnected`] unless the machine is [`ConnectionState::Open`]; nothing is
/// queued across reconnects.
#[derive(Clone)]
pub struct RetryConnection {
    shared: Arc<Shared>,
}

impl RetryConnection {
    /// Create the machine in the `Closed` state.  Nothing happens until [`Self::connect`].
    ///
    /// Inbound requests on every connection the machine opens are handed to `dispatcher`.
    pub fn new<C: Connector>(
        connector: C,
        config: RetryConfig,
        dispatcher: Option<Arc<dyn Dispatch>>,
    ) -> (Self, RetryEvents) {
        let (link_tx, link_rx) = watch::channel(Link {
            state: ConnectionState::Closed,
            connection: None,
        });
        let (connect_tx, connect_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let finished = CancellationToken::new();

        let supervisor = Supervisor {
            connector,
            backoff: Backoff::new(config.interval, config.max_interval),
            config,
            dispatcher,
            link: link_tx,
            events: events_tx,
            stop: stop.clone(),
            connect_requested: connect_rx,
        };

        let span = tracing::debug_span!("retry_connection");
        let supervisor_finished = finished.clone();
        tokio::spawn(
            async move {
                if let Err(e) = AssertUnwindSafe(supervisor.run()).catch_unwind().await {
                    tracing::error!(panic = %error::panic_err_to_string(e), "Retry supervisor panicked");
                }
                supervisor_finished.cancel();
            }
            .instrument(span),
        );

        let shared = Shared {
            link: link_rx,
            connect_requested: connect_tx,
            _drop_guard: stop.clone().drop_guard(),
            stop,
            finished,
        };

        (
            Self {
                shared: Arc::new(shared),
            },
            RetryEvents { receiver: events_rx },
        )
    }

    /// Start connecting.
    ///
    /// This may be called once, while the machine is in its initial `Closed` state; from then on
    /// the machine reconnects by itself.
    pub fn connect(&self) -> Result<()> {
        let from = self.state();
        let mut accepted = false;

        self.shared.connect_requested.send_if_modified(|requested| {
            if *requested || from != ConnectionState::Closed {
                false
            } else {
                *requested = true;
                accepted = true;
                true
            }
        });

        if accepted {
            Ok(())
        } else {
            Err(JsonRpcError::InvalidTransition {
                from,
                to: ConnectionState::Connecting,
            })
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.borrow().state
    }

    /// The open connection, if there is one
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.shared.link.borrow().connection.clone()
    }

    /// Wait until the machine reaches `Open`.
    ///
    /// Fails with [`JsonRpcError::Disposed`] if the machine stops first.
    pub async fn opened(&self) -> Result<ConnectionHandle> {
        let mut receiver = self.shared.link.clone();
        let link = receiver
            .wait_for(|link| link.connection.is_some())
            .await
            .map_err(|_| JsonRpcError::Disposed)?;
        link.connection.clone().ok_or(JsonRpcError::Disposed)
    }

    fn open_connection(&self) -> Result<ConnectionHandle> {
        let link = self.shared.link.borrow();
        match (&link.state, &link.connection) {
            (ConnectionState::Open, Some(connection)) => Ok(connection.clone()),
            _ => Err(JsonRpcError::NotConnected),
        }
    }

    pub async fn request(&self, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Result<JsonValue> {
        self.open_connection()?.request(method, params).await
    }

    pub async fn notify(&self, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Result<()> {
        self.open_connection()?.notify(method, params).await
    }

    pub async fn call<Resp: DeserializeOwned>(&self, method: impl Into<String>) -> Result<Resp> {
        self.open_connection()?.call(method).await
    }

    pub async fn call_with_params<Req, Resp>(&self, method: impl Into<String>, params: Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.open_connection()?.call_with_params(method, params).await
    }

    pub async fn notify_with_params<Req: Serialize>(&self, method: impl Into<String>, params: Req) -> Result<()> {
        self.open_connection()?.notify_with_params(method, params).await
    }

    /// Stop the machine, closing the open connection if there is one, and wait for it to finish.
    pub async fn close(&self) {
        self.shared.stop.cancel();
        self.shared.finished.cancelled().await;
    }
}

impl fmt::Debug for RetryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConnection")
            .field("state", &self.state())
            .finish()
    }
}

/// Wait between connection attempts
#[derive(Clone, Debug)]
struct Backoff {
    interval: Duration,
    max_interval: Option<Duration>,
    current: Duration,
}

impl Backoff {
    fn new(interval: Duration, max_interval: Option<Duration>) -> Self {
        Self {
            interval,
            max_interval,
            current: interval,
        }
    }

    /// How long to wait this time
    fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        if let Some(max) = self.max_interval {
            self.current = (self.current * 2).min(max.max(self.interval));
        }
        wait
    }

    fn reset(&mut self) {
        self.current = self.interval;
    }
}

struct Supervisor<C> {
    connector: C,
    config: RetryConfig,
    backoff: Backoff,
    dispatcher: Option<Arc<dyn Dispatch>>,
    link: watch::Sender<Link>,
    events: mpsc::UnboundedSender<RetryEvent>,
    stop: CancellationToken,
    connect_requested: watch::Receiver<bool>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        tokio::select! {
            _ = self.stop.cancelled() => {
                tracing::debug!("Stopped before connecting");
                return;
            }
            requested = self.connect_requested.wait_for(|requested| *requested) => {
                if requested.is_err() {
                    return;
                }
            }
        }

        loop {
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.stop.cancelled() => {
                    self.set_state(ConnectionState::Closed);
                    break;
                }
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(transport) => {
                    let (connection, events) =
                        connection::spawn(transport, self.config.connection.clone(), self.dispatcher.clone());
                    self.set_open(connection.clone());
                    self.emit(RetryEvent::Open);
                    self.backoff.reset();

                    match self.forward_events(events).await {
                        Some(reason) => {
                            tracing::info!(?reason, "Connection closed; will reconnect");
                            self.set_state(ConnectionState::Closed);
                            self.emit(RetryEvent::Close(reason));
                        }
                        None => {
                            connection.close().await;
                            self.set_state(ConnectionState::Closed);
                            self.emit(RetryEvent::Close(CloseReason::Local));
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "Failed to connect");
                    self.set_state(ConnectionState::Closed);
                    self.emit(RetryEvent::ConnectError(e.to_string()));
                }
            }

            self.set_state(ConnectionState::Waiting);
            let wait = self.backoff.next_wait();
            tracing::debug!(?wait, "Waiting before reconnecting");

            tokio::select! {
                _ = self.stop.cancelled() => {
                    self.set_state(ConnectionState::Closed);
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    self.set_state(ConnectionState::Closed);
                }
            }
        }

        tracing::debug!("Retry supervisor stopped");
    }

    /// Pass the open connection's events along until it closes.  Returns `None` if the machine
    /// was told to stop first.
    async fn forward_events(&self, mut events: ConnectionEvents) -> Option<CloseReason> {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return None,
                event = events.recv() => match event {
                    Some(ConnectionEvent::Notification(notification)) => {
                        self.emit(RetryEvent::Notification(notification));
                    }
                    Some(ConnectionEvent::Error(e)) => self.emit(RetryEvent::Error(e)),
                    Some(ConnectionEvent::Message(_)) => {}
                    Some(ConnectionEvent::Close(reason)) => return Some(reason),
                    None => {
                        tracing::error!("BUG: Connection events ended without a close event");
                        return Some(CloseReason::TransportError("Connection event loop exited".to_string()));
                    }
                },
            }
        }
    }

    fn set_open(&self, connection: ConnectionHandle) {
        self.update(ConnectionState::Open, Some(connection));
    }

    fn set_state(&self, state: ConnectionState) {
        self.update(state, None);
    }

    fn update(&self, to: ConnectionState, connection: Option<ConnectionHandle>) {
        let mut moved = false;
        self.link.send_if_modified(|link| match link.state.transition(to) {
            Ok(state) => {
                link.state = state;
                link.connection = connection;
                moved = true;
                true
            }
            Err(e) => {
                tracing::error!(err = %e, "BUG: Retry state machine attempted an invalid transition");
                false
            }
        });

        if moved {
            tracing::debug!(state = %to, "Retry connection state changed");
            self.emit(RetryEvent::State(to));
        }
    }

    fn emit(&self, event: RetryEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}
