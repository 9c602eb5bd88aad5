//! A bidirectional JSON-RPC 2.0 engine over persistent, message-oriented transports.
//!
//! Either end of a [`connection`] can send requests and notifications and serve the other end's
//! requests.  Inbound requests run through a dispatch pipeline of [`Middleware`] (usually ending
//! in one or more [`Router`]s of async handler functions) which always produces exactly one
//! response.  [`RetryConnection`] wraps the whole thing in a state machine that reconnects when
//! the transport drops, and every connection watches its peer with a heartbeat so half-open
//! transports are noticed.
//!
//! [`Application`] and [`Client`] are the usual entry points for servers and clients.
//!
//! This library owes a debt to the [`jsonrpsee`](https://github.com/paritytech/jsonrpsee) project,
//! whose wire types it reuses.

/// Re-export the exact async-trait macro we use, for implementing [`Middleware`]
#[doc(hidden)]
pub use async_trait::async_trait;

mod application;
mod client;
mod codec;
pub mod connection;
mod context;
mod dispatch;
mod error;
mod extensions;
mod handler;
mod heartbeat;
mod middleware;
mod protocol;
mod retry;
mod router;
#[cfg(test)]
pub mod testing;
mod tracker;
mod transport;
mod types;

pub use application::{Application, ApplicationBuilder, ApplicationConfig};
pub use client::{Client, ClientBuilder};
pub use codec::{JsonLinesCodec, LineFrame};
pub use connection::{
    CloseReason, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionHandle,
    PendingResponse,
};
pub use context::{Context, Outcome};
pub use dispatch::{Dispatch, Pipeline};
pub use error::{JsonRpcError, Result};
pub use extensions::Extensions;
pub use handler::{FromContext, Handler, IntoResponse, MethodName, Params, RawParams, RequestId, into_middleware};
pub use middleware::{Extension, Middleware, Next, layer};
pub use protocol::{FrameError, Inbound, classify, serialize};
pub use retry::{ConnectionState, RetryConfig, RetryConnection, RetryEvent, RetryEvents};
pub use router::Router;
pub use transport::{Connector, FnConnector, TcpLinesConnector, Transport, TransportEvent, connector_fn};
pub use types::{
    DEFAULT_APPLICATION_ERROR_CODE, ErrorCode, ErrorDetails, ErrorResponse, Id, JsonValue, Message, Notification,
    PING, PONG, Request, Response, ResponsePayload, SuccessResponse, TwoPointZero,
};
