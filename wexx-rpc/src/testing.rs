//! Helpers for testing the JSON RPC implementation.
//!
//! This module is only compiled when `test` is enabled; integration tests include it by path.
#![allow(dead_code)]

use futures::StreamExt;
use futures::channel::mpsc;

/// Initialize tracing with a subscriber and some reasonable defaults suitable for enabling log
/// output in tests.
///
/// This is idempotent; it can be called from multiple tests in multiple threads but will only
/// initialize tracing once.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "wexx_rpc=debug";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init();
    });
}

/// In-memory transport: a stream of inbound frames paired with a sink for outbound ones
pub type TestTransport = (
    futures::stream::Map<mpsc::Receiver<String>, fn(String) -> Result<String, std::io::Error>>,
    mpsc::Sender<String>,
);

/// Make a pair of in-memory transports connected to each other.
pub fn setup_test_channel() -> (TestTransport, TestTransport) {
    let (client_tx, server_rx) = mpsc::channel(32);
    let (server_tx, client_rx) = mpsc::channel(32);

    let ok: fn(String) -> Result<String, std::io::Error> = Ok;
    ((client_rx.map(ok), client_tx), (server_rx.map(ok), server_tx))
}

/// Raw side of an in-memory link, for tests that play the remote peer by hand
pub struct RawPeer {
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
}

impl RawPeer {
    /// Send one frame of raw text
    pub async fn send(&mut self, text: impl Into<String>) {
        use futures::SinkExt;
        self.outgoing.send(text.into()).await.expect("raw peer send failed");
    }

    /// Receive the next frame and parse it as JSON, or `None` if the other side closed
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.incoming.next().await?;
        Some(serde_json::from_str(&text).expect("peer sent invalid JSON"))
    }
}

/// Make a transport whose other end is driven by hand through a [`RawPeer`]
pub fn setup_raw_peer() -> (TestTransport, RawPeer) {
    let (transport, (incoming, outgoing)) = {
        let (to_peer_tx, to_peer_rx) = mpsc::channel(32);
        let (from_peer_tx, from_peer_rx) = mpsc::channel(32);
        let ok: fn(String) -> Result<String, std::io::Error> = Ok;
        ((from_peer_rx.map(ok), to_peer_tx), (to_peer_rx, from_peer_tx))
    };
    (transport, RawPeer { incoming, outgoing })
}
