//! The event loop servicing a single connection.
//!
//! This is not part of the public API, but this can be thought of as the beating heart of either
//! side of the protocol.  There are no mutexes here: a single connection is serviced in a single
//! async task, and code outside of it communicates with it using [`ConnectionHandle`].
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{CloseReason, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionHandle};
use crate::dispatch::Dispatch;
use crate::heartbeat::{self, HeartbeatAction, HeartbeatMonitor};
use crate::protocol::{self, Inbound};
use crate::tracker::{Completion, RequestTracker};
use crate::{JsonRpcError, Result};
use crate::{transport, types};

/// An outgoing message submitted by a [`ConnectionHandle`], and the one-shot channel on which the
/// outcome is reported.
pub(crate) enum OutboundMessage {
    /// A method call.  The event loop allocates its ID, and the response channel will receive the
    /// response from the remote peer.
    Request {
        method: String,
        params: Option<types::JsonValue>,
        response_tx: Completion,
    },
    /// Anything else.  The channel receives confirmation that the message was passed to the
    /// transport.
    Message {
        message: types::Message,
        send_confirmation_tx: oneshot::Sender<Result<()>>,
    },
}

pub(super) struct ConnectionLoop {
    config: ConnectionConfig,

    peer: transport::Peer,

    /// Set once the transport is known to be gone, after which nothing more is sent
    peer_closed: bool,

    /// Requests that have been sent and are waiting on a response
    tracker: RequestTracker,

    heartbeat: Option<HeartbeatMonitor>,

    dispatcher: Option<Arc<dyn Dispatch>>,

    /// Tasks running the dispatch pipeline for inbound requests.  When they complete they yield
    /// the response to send, if any.
    inbound_operations: JoinSet<Option<types::Response>>,

    /// Request ID of each task in [`Self::inbound_operations`]
    inbound_by_task_id: HashMap<tokio::task::Id, types::Id>,

    /// The request IDs in [`Self::inbound_by_task_id`], for duplicate detection
    inbound_request_ids: HashSet<types::Id>,

    outbound_messages: mpsc::Receiver<OutboundMessage>,

    /// Used to make handles for the dispatch pipeline.  Weak, so that dropping every external
    /// handle closes the connection.
    outbound_sender: mpsc::WeakSender<OutboundMessage>,

    close_token: CancellationToken,

    done: CancellationToken,

    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionLoop {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: ConnectionConfig,
        peer: transport::Peer,
        dispatcher: Option<Arc<dyn Dispatch>>,
        outbound_messages: mpsc::Receiver<OutboundMessage>,
        outbound_sender: mpsc::WeakSender<OutboundMessage>,
        close_token: CancellationToken,
        done: CancellationToken,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::from_config(config.heartbeat_interval);
        Self {
            config,
            peer,
            peer_closed: false,
            tracker: RequestTracker::new(),
            heartbeat,
            dispatcher,
            inbound_operations: JoinSet::new(),
            inbound_by_task_id: HashMap::new(),
            inbound_request_ids: HashSet::new(),
            outbound_messages,
            outbound_sender,
            close_token,
            done,
            events,
        }
    }

    /// Run the event loop until the connection closes, then shut down in an orderly fashion
    pub(super) async fn run(mut self) {
        tracing::debug!(
            heartbeat_interval = ?self.config.heartbeat_interval,
            request_timeout = ?self.config.request_timeout,
            "Event loop is starting"
        );

        let reason = loop {
            let next_deadline = self.tracker.next_deadline();

            tokio::select! {
                outbound_message = self.outbound_messages.recv() => {
                    match outbound_message {
                        Some(outbound_message) => {
                            self.handle_outbound_message(outbound_message).await;
                        },
                        None => {
                            tracing::debug!("All connection handles dropped; event loop terminating");
                            break CloseReason::Local;
                        }
                    }
                },
                result = self.peer.receive_event() => {
                    match result {
                        Ok(Some(event)) => {
                            if let Some(heartbeat) = self.heartbeat.as_mut() {
                                heartbeat.on_traffic();
                            }
                            self.handle_transport_event(event).await;
                        }
                        Ok(None) => {
                            tracing::debug!("Peer closed connection; event loop terminating");
                            self.peer_closed = true;
                            break CloseReason::PeerClosed;
                        }
                        Err(e) => {
                            tracing::error!(err = %e, "Error receiving message from peer");
                            self.peer_closed = true;
                            self.emit(ConnectionEvent::Error(ConnectionError::Transport(e.to_string())));
                            break CloseReason::TransportError(e.to_string());
                        }
                    }
                },
                next = self.inbound_operations.join_next_with_id(),
                    if !self.inbound_operations.is_empty() => {
                    if let Some(result) = next {
                        self.handle_pending_operation_completion(result).await;
                    }
                },
                action = heartbeat::next_tick(self.heartbeat.as_mut()) => {
                    match action {
                        HeartbeatAction::Probe => self.send_probe().await,
                        HeartbeatAction::Terminate => {
                            tracing::warn!(
                                heartbeat_interval = ?self.config.heartbeat_interval,
                                "Remote peer did not answer the last liveness probe; terminating connection"
                            );
                            break CloseReason::HeartbeatTimeout;
                        }
                    }
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() => {
                    self.tracker.expire(Instant::now());
                },
                _ = self.close_token.cancelled() => {
                    tracing::debug!("Close requested, shutting down connection");
                    break CloseReason::Local;
                }
            }
        };

        self.shutdown(reason).await;
    }

    /// Bring everything in flight to some conclusion, then announce the close.
    ///
    /// If the peer is already gone, responses can't be sent, but pending operations on this side
    /// still get resolved.
    async fn shutdown(mut self, reason: CloseReason) {
        // The heartbeat has no business running past this point
        self.heartbeat = None;

        if !self.close_token.is_cancelled() {
            self.close_token.cancel();
        }

        // No more messages can be submitted by anyone holding a handle.  Anything left in the
        // queue is told that the connection is closed.
        self.outbound_messages.close();
        while let Some(outbound_message) = self.outbound_messages.recv().await {
            match outbound_message {
                OutboundMessage::Request {
                    method, response_tx, ..
                } => {
                    tracing::debug!(%method, "Cancelling outbound request due to shutdown");
                    let _ = response_tx.send(Err(JsonRpcError::ConnectionClosed));
                }
                OutboundMessage::Message {
                    message,
                    send_confirmation_tx,
                } => {
                    let (message_type, _, method) = message.diagnostic_context();
                    tracing::debug!(message_type, method = method.unwrap_or_default(),
                        "Cancelling outbound message due to shutdown");
                    let _ = send_confirmation_tx.send(Err(JsonRpcError::Disposed));
                }
            }
        }

        // The transport is no longer read, so requests awaiting a response will not get one.  Fail
        // them before waiting on inbound handlers, which may themselves be awaiting one.
        let failed = self.tracker.fail_all(|| JsonRpcError::ConnectionClosed);
        tracing::debug!(num_failed_requests = failed, "Failed all pending outbound requests");

        // Give inbound requests that are still running a chance to finish before they are
        // forcibly aborted.  The duration is configurable.
        {
            let deadline: Option<Instant> = self
                .config
                .graceful_shutdown_timeout
                .and_then(|timeout| Instant::now().checked_add(timeout));
            tracing::debug!(
                num_pending_inbound_operations = self.inbound_operations.len(),
                graceful_shutdown_timeout = ?self.config.graceful_shutdown_timeout,
                "Waiting for pending inbound operations to complete"
            );

            let result = loop {
                let result = match deadline {
                    Some(deadline) => {
                        tokio::time::timeout_at(deadline, self.inbound_operations.join_next_with_id()).await
                    }
                    None => Ok(self.inbound_operations.join_next_with_id().await),
                };
                match result {
                    Ok(Some(result)) => {
                        self.handle_pending_operation_completion(result).await;
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };

            if result.is_err() {
                tracing::warn!(
                    graceful_shutdown_timeout = ?self.config.graceful_shutdown_timeout,
                    num_pending_inbound_operations = self.inbound_operations.len(),
                    "Timed out waiting for pending inbound operations to complete; \
                        their async tasks will now be aborted");
                self.inbound_operations.abort_all();
                while let Some(result) = self.inbound_operations.join_next_with_id().await {
                    self.handle_pending_operation_completion(result).await;
                }
            }
        }

        if !self.peer_closed {
            if let Err(e) = self.peer.close().await {
                tracing::debug!(err = %e, "Error closing transport");
            }
            self.peer_closed = true;
        }

        debug_assert!(self.inbound_by_task_id.is_empty());
        debug_assert!(self.inbound_request_ids.is_empty());

        tracing::debug!(termination_reason = ?reason, "Event loop is exiting");
        self.emit(ConnectionEvent::Close(reason));
        self.done.cancel();
    }

    fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Send a message to the remote peer, handling serialization and error logging.
    async fn send_message(&mut self, message: types::Message) -> Result<()> {
        let (message_type, request_id, method) = message.diagnostic_context();
        let request_id = request_id.map(|id| id.to_string()).unwrap_or_default();
        let method = method.unwrap_or_default().to_string();

        if self.peer_closed {
            tracing::debug!(message_type, %method, %request_id,
                "Not sending message; transport is already closed");
            return Err(JsonRpcError::Disposed);
        }

        let message_str = match protocol::serialize(&message) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(err = %e, message_type, %method, %request_id,
                    "Failed to serialize message to JSON");
                return Err(e);
            }
        };

        match self.peer.send_message(message_str).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(err = %e, message_type, %method, %request_id,
                    "Failed to send message to peer; likely the connection was closed by the remote peer");
                Err(e)
            }
        }
    }

    /// Pass an outbound message to the transport
    ///
    /// This is infallible because any errors from the transport layer are reported back to the
    /// outbound message's oneshot channel.
    async fn handle_outbound_message(&mut self, outbound_message: OutboundMessage) {
        match outbound_message {
            OutboundMessage::Request {
                method,
                params,
                response_tx,
            } => {
                // Not a race: this loop is the only reader of the transport, so no response can
                // arrive before the request is tracked
                let id = self.tracker.next_id();
                let request = types::Request::new(id.clone(), method.clone(), params);
                if let Err(e) = self.send_message(types::Message::Request(request)).await {
                    let _ = response_tx.send(Err(e));
                } else if let Err((e, response_tx)) =
                    self.tracker.track(id, method, response_tx, self.config.request_timeout)
                {
                    let _ = response_tx.send(Err(e));
                }
            }
            OutboundMessage::Message {
                message,
                send_confirmation_tx,
            } => {
                let result = self.send_message(message).await;
                let _ = send_confirmation_tx.send(result);
            }
        }
    }

    async fn handle_transport_event(&mut self, event: transport::TransportEvent) {
        match event {
            transport::TransportEvent::Pong => {
                tracing::trace!("Received transport-level pong");
            }
            transport::TransportEvent::Malformed(reason) => {
                tracing::warn!(%reason, "Undecodable frame from peer");
                let _ = self
                    .send_message(types::Message::Response(protocol::FrameError::Parse { reason }.to_response()))
                    .await;
            }
            transport::TransportEvent::Message(text) => match protocol::classify(&text) {
                Ok(inbound) => self.handle_inbound_message(inbound).await,
                Err(frame_error) => {
                    tracing::warn!(err = %frame_error, "Malformed message from peer");
                    let _ = self
                        .send_message(types::Message::Response(frame_error.to_response()))
                        .await;
                }
            },
        }
    }

    /// Process an inbound message that was classified successfully
    async fn handle_inbound_message(&mut self, inbound: Inbound) {
        tracing::trace!(kind = inbound.kind(), "About to process an inbound message");
        self.emit(ConnectionEvent::Message(inbound.clone()));

        match inbound {
            Inbound::Request(request) => self.handle_inbound_request(request).await,
            Inbound::Response(response) => self.tracker.complete(response),
            Inbound::Notification(notification) if notification.method == types::PING => {
                let _ = self
                    .send_message(types::Message::Notification(types::Notification::new(
                        types::PONG,
                        None,
                    )))
                    .await;
            }
            Inbound::Notification(notification) if notification.method == types::PONG => {
                tracing::trace!("Received pong");
            }
            Inbound::Notification(notification) => {
                self.emit(ConnectionEvent::Notification(notification));
            }
            Inbound::NotificationError(error) => {
                tracing::debug!(code = error.code(), message = %error.message,
                    "Remote peer reported an error");
                self.emit(ConnectionEvent::Error(ConnectionError::Remote(error)));
            }
        }
    }

    async fn handle_inbound_request(&mut self, request: types::Request) {
        let request_id = request.id.clone();

        // A peer reusing the ID of a request we are still working on would make the two responses
        // indistinguishable
        if self.inbound_request_ids.contains(&request_id) {
            tracing::error!(%request_id, method = %request.method,
                "Remote peer sent a duplicate request ID!");
            // The ID is deliberately omitted; the original request will still get its response
            let _ = self
                .send_message(types::Message::Response(types::Response::error_detail(
                    types::Id::Null,
                    types::ErrorDetails::invalid_request(
                        "Duplicate request ID",
                        json!({
                            "duplicated_request_id": request_id,
                            "method": request.method,
                        }),
                    ),
                )))
                .await;
            return;
        }

        let Some(dispatcher) = self.dispatcher.clone() else {
            tracing::debug!(%request_id, method = %request.method,
                "No dispatcher on this connection; request is unhandled");
            let _ = self
                .send_message(types::Message::Response(types::Response::error_detail(
                    request_id,
                    types::ErrorDetails::unhandled_request(&request.method),
                )))
                .await;
            return;
        };

        let Some(sender) = self.outbound_sender.upgrade() else {
            // Every handle is gone, so the loop is about to exit
            let _ = self
                .send_message(types::Message::Response(types::Response::error_detail(
                    request_id,
                    types::ErrorDetails::internal_error("Connection is closing", None),
                )))
                .await;
            return;
        };
        let handle = ConnectionHandle::new(sender, self.close_token.clone(), self.done.clone());

        let span = tracing::debug_span!("inbound_request", %request_id, method = %request.method);
        let task_id = self.spawn_operation(dispatcher.dispatch(handle, request).instrument(span));

        tracing::trace!(%request_id, ?task_id, "Inbound request spawned a new task");
        self.inbound_request_ids.insert(request_id.clone());
        self.inbound_by_task_id.insert(task_id, request_id);
    }

    /// Spawn a future that is processing an incoming request.  Returns the Tokio task ID.
    fn spawn_operation(
        &mut self,
        operation: impl Future<Output = Option<types::Response>> + Send + 'static,
    ) -> tokio::task::Id {
        let span = tracing::Span::current();
        self.inbound_operations.spawn(operation.instrument(span)).id()
    }

    /// An async task that was started to handle a request from the remote peer has completed,
    /// either successfully or not.
    async fn handle_pending_operation_completion(
        &mut self,
        result: std::result::Result<(tokio::task::Id, Option<types::Response>), tokio::task::JoinError>,
    ) {
        match result {
            Ok((task_id, response)) => {
                if let Some(request_id) = self.inbound_by_task_id.remove(&task_id) {
                    self.inbound_request_ids.remove(&request_id);
                    tracing::trace!(%task_id, %request_id, "Pending inbound request completed");
                }

                if let Some(response) = response {
                    let _ = self.send_message(types::Message::Response(response)).await;
                }
            }
            Err(join_err) => {
                // The task panicked or was aborted.  Either way the peer still gets an answer.
                let task_id = join_err.id();
                let request_id = self.inbound_by_task_id.remove(&task_id);

                if let Some(request_id) = &request_id {
                    self.inbound_request_ids.remove(request_id);
                    let _ = self
                        .send_message(types::Message::Response(types::Response::error_detail(
                            request_id.clone(),
                            types::ErrorDetails::internal_error("Task was cancelled or panicked", None),
                        )))
                        .await;
                }

                let request_id = request_id.map(|id| id.to_string()).unwrap_or_default();
                if join_err.is_panic() {
                    tracing::error!(%task_id, %request_id, %join_err, "Pending operation panicked");
                } else {
                    tracing::warn!(%task_id, %request_id, %join_err,
                        "Pending operation was cancelled (presumably due to connection shutdown)");
                }
            }
        }
    }

    /// Send a liveness probe, natively if the transport can
    async fn send_probe(&mut self) {
        tracing::trace!("Sending liveness probe");
        if self.peer.supports_ping() {
            if let Err(e) = self.peer.send_ping().await {
                tracing::warn!(err = %e, "Failed to send transport-level ping");
            }
        } else {
            let _ = self
                .send_message(types::Message::Notification(types::Notification::new(
                    types::PING,
                    None,
                )))
                .await;
        }
    }
}
