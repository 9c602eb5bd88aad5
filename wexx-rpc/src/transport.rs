//! In this crate, the concept of a "transport" abstracts away the details of how JSON-RPC messages
//! are sent and received.  A transport is a persistent, full-duplex, message-oriented link: a
//! WebSocket, a newline-delimited TCP stream, a pair of in-memory channels.
//!
//! At the JSON RPC level a transport is very simply a source of and sink of text frames, plus an
//! optional native liveness probe.  Framing, TLS and compression are the transport's business.
//!
//! The retry machinery in [`crate::retry`] needs to make fresh transports on demand; that is what
//! [`Connector`] is for.
use std::borrow::Cow;
use std::pin::Pin;

use crate::{JsonRpcError, Result};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt, TryFutureExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::{JsonLinesCodec, LineFrame};

/// Something received from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One frame of text
    Message(String),
    /// Reply to a transport-level ping sent by [`Transport::send_ping`]
    Pong,
    /// A frame arrived but could not be decoded as text.  The connection answers it with a parse
    /// error and keeps going.
    Malformed(String),
}

/// A transport is a source and sink of JSON-RPC messages, that interfaces with some underlying
/// tranport layer provided by the caller.
///
/// From the transport's perspective the text frames should be considered opaque.
pub trait Transport: Send + Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transport-specific identifier of the remote peer, useful for logging and debugging.
    fn remote_peer(&self) -> Cow<'static, str>;

    /// Send a message to the transport.  Should not complete until the message has been handed off
    /// to the transport layer, whatever that means for the partciular transport.
    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Receive the next event from the transport.
    ///
    /// This future must be cancelation-safe, such that if the returned future is dropped before
    /// it completes, it will not result in incomplete messages being received or in missed
    /// messages.  The connection event loop polls it in a `select!` alongside its timers.
    ///
    /// This should return `Ok(None)` if the transport is closed and no more messages can be
    /// received.
    fn receive_event(&mut self) -> impl Future<Output = Result<Option<TransportEvent>, Self::Error>> + Send + '_;

    /// Close the transport.  Called once, when the connection is shutting down for any reason.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        futures::future::ready(Ok(()))
    }

    /// Whether this transport has a native ping whose reply arrives as [`TransportEvent::Pong`].
    ///
    /// When it doesn't, liveness is probed with an in-band `ping` notification instead.
    fn supports_ping(&self) -> bool {
        false
    }

    /// Send a transport-level ping.  Only called if [`Self::supports_ping`] is true.
    fn send_ping(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        futures::future::ready(Ok(()))
    }
}

/// Internal dyn-compatible wrapper trate around [`Transport`] to erase the types and allow dynamic
/// dispatch
trait BoxedTransport: Send + 'static {
    fn boxed_remote_peer(&self) -> Cow<'static, str>;
    fn boxed_send_message(&mut self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
    fn boxed_receive_event(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<TransportEvent>>> + Send + '_>>;
    fn boxed_close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
    fn boxed_supports_ping(&self) -> bool;
    fn boxed_send_ping(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

fn transport_error(e: impl std::error::Error + Send + Sync + 'static) -> JsonRpcError {
    JsonRpcError::Transport { source: Box::new(e) }
}

impl<T> BoxedTransport for T
where
    T: Transport + 'static,
{
    fn boxed_remote_peer(&self) -> Cow<'static, str> {
        <Self as Transport>::remote_peer(self)
    }

    fn boxed_send_message(&mut self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        <Self as Transport>::send_message(self, message)
            .map_err(transport_error)
            .boxed()
    }

    fn boxed_receive_event(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<TransportEvent>>> + Send + '_>> {
        <Self as Transport>::receive_event(self)
            .map_err(transport_error)
            .boxed()
    }

    fn boxed_close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        <Self as Transport>::close(self).map_err(transport_error).boxed()
    }

    fn boxed_supports_ping(&self) -> bool {
        <Self as Transport>::supports_ping(self)
    }

    fn boxed_send_ping(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        <Self as Transport>::send_ping(self).map_err(transport_error).boxed()
    }
}

/// Implement transport on a stream/sink pair, mainly for testing and for adapting channel-based
/// transports like WebSocket libraries.
impl<In, InErr, Out> Transport for (In, Out)
where
    In: Stream<Item = Result<String, InErr>> + Unpin + Send + 'static,
    InErr: std::error::Error + Send + Sync + 'static,
    Out: Sink<String> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = JsonRpcError;

    fn remote_peer(&self) -> Cow<'static, str> {
        format!(
            "({}, {})",
            std::any::type_name::<In>(),
            std::any::type_name::<Out>(),
        )
        .into()
    }

    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.1.send(message).map_err(transport_error)
    }

    fn receive_event(&mut self) -> impl Future<Output = Result<Option<TransportEvent>, Self::Error>> + Send + '_ {
        self.0.next().map(|opt_result: Option<Result<_, InErr>>| {
            // Convert this from Option<Result<T>> to Result<Option<T>>
            let result = opt_result.transpose();

            result
                .map(|message| message.map(TransportEvent::Message))
                .map_err(transport_error)
        })
    }

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        SinkExt::<String>::close(&mut self.1).map_err(transport_error)
    }
}

/// Implementation of [`Transport`] that is generic over any type that implements
/// [`tokio::io::AsyncRead`] and [`tokio::io::AsyncWrite`].
///
/// Reads and writes messages assuming that each message is UTF-8 text separated by newline
/// characters.  Lines that are not UTF-8, or are longer than the codec allows, come through as
/// [`TransportEvent::Malformed`]; only I/O errors are errors.
impl<Io> Transport for Framed<Io, JsonLinesCodec>
where
    Io: Send + Unpin + AsyncRead + AsyncWrite + 'static,
{
    type Error = JsonRpcError;

    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Io>())
    }

    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        SinkExt::<String>::send(self, message).map_err(transport_error)
    }

    fn receive_event(&mut self) -> impl Future<Output = Result<Option<TransportEvent>, Self::Error>> + Send + '_ {
        // NOTE: `StreamExt::next` doesn't take ownership of the stream so it is cancel safe
        StreamExt::next(self).map(|opt_result: Option<Result<LineFrame, std::io::Error>>| {
            opt_result
                .transpose()
                .map(|frame| {
                    frame.map(|frame| match frame {
                        LineFrame::Text(text) => TransportEvent::Message(text),
                        LineFrame::Malformed(reason) => TransportEvent::Malformed(reason),
                    })
                })
                .map_err(transport_error)
        })
    }

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        SinkExt::<String>::close(self).map_err(transport_error)
    }
}

/// Wrapper around a [`Transport`] implementation which erases the transport type and standardizes
/// the error type for failures to [`JsonRpcError`].
///
/// Owned by exactly one connection event loop, so unlike the transport itself there is no need for
/// it to be `Sync`.
pub(crate) struct Peer {
    remote_peer: String,
    transport: Box<dyn BoxedTransport>,
}

impl Peer {
    /// Wrap a [`Transport`] implementation in a [`Peer`] object.
    pub(crate) fn new(transport: impl Transport) -> Self {
        Self {
            remote_peer: transport.remote_peer().to_string(),
            transport: Box::new(transport),
        }
    }

    /// Return the remote peer's identifier, which is transport-specific.
    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    /// Span that connection-level log events are recorded in
    pub(crate) fn span(&self) -> tracing::Span {
        tracing::debug_span!("connection", remote_peer = %self.remote_peer)
    }

    pub(crate) async fn send_message(&mut self, message: String) -> Result<()> {
        self.transport.boxed_send_message(message).await
    }

    pub(crate) async fn receive_event(&mut self) -> Result<Option<TransportEvent>> {
        self.transport.boxed_receive_event().await
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        self.transport.boxed_close().await
    }

    pub(crate) fn supports_ping(&self) -> bool {
        self.transport.boxed_supports_ping()
    }

    pub(crate) async fn send_ping(&mut self) -> Result<()> {
        self.transport.boxed_send_ping().await
    }
}

/// Makes new transports on demand, for use by [`crate::RetryConnection`].
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish a new transport to the remote peer
    fn connect(&self) -> impl Future<Output = Result<Self::Transport, Self::Error>> + Send + '_;
}

/// [`Connector`] built from a closure; see [`connector_fn`]
#[derive(Clone)]
pub struct FnConnector<F>(F);

/// Make a [`Connector`] out of a closure returning a future that yields a transport
pub fn connector_fn<F, Fut, T, E>(f: F) -> FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Transport,
    E: std::error::Error + Send + Sync + 'static,
{
    FnConnector(f)
}

impl<F, Fut, T, E> Connector for FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Transport,
    E: std::error::Error + Send + Sync + 'static,
{
    type Transport = T;
    type Error = E;

    fn connect(&self) -> impl Future<Output = Result<Self::Transport, Self::Error>> + Send + '_ {
        (self.0)()
    }
}

/// Connects to a TCP address and frames the stream as newline-delimited JSON.
#[derive(Clone, Debug)]
pub struct TcpLinesConnector {
    address: String,
    max_line_length: Option<usize>,
}

impl TcpLinesConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_line_length: None,
        }
    }

    /// Lines longer than this many bytes are answered with a parse error and skipped
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = Some(max_line_length);
        self
    }
}

impl Connector for TcpLinesConnector {
    type Transport = Framed<TcpStream, JsonLinesCodec>;
    type Error = std::io::Error;

    fn connect(&self) -> impl Future<Output = Result<Self::Transport, Self::Error>> + Send + '_ {
        async move {
            let stream = TcpStream::connect(&self.address).await?;
            let codec = match self.max_line_length {
                Some(max) => JsonLinesCodec::new_with_max_length(max),
                None => JsonLinesCodec::new(),
            };
            Ok(Framed::new(stream, codec))
        }
    }
}
