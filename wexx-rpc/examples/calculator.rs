//! A calculator served over newline-delimited JSON on a local TCP port.
//!
//! The server exposes `add`, `divide` and `greet`.  The client in the same process calls them, and
//! serves a `whoami` method of its own which `greet` calls back into.  Before shutting down the
//! server sends a `display` notification to every connected client.
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use wexx_rpc::{
    Application, Client, ConnectionHandle, ErrorDetails, JsonLinesCodec, Params, RetryEvent, Router, TcpLinesConnector,
};

#[derive(Deserialize)]
struct DivideParams {
    dividend: f64,
    divisor: f64,
}

async fn add(Params(numbers): Params<Vec<f64>>) -> Result<f64, anyhow::Error> {
    Ok(numbers.into_iter().sum())
}

async fn divide(Params(params): Params<DivideParams>) -> Result<f64, ErrorDetails> {
    if params.divisor == 0.0 {
        return Err(ErrorDetails::application("Division by zero", None));
    }
    Ok(params.dividend / params.divisor)
}

async fn greet(connection: ConnectionHandle) -> Result<String, anyhow::Error> {
    let name: String = connection.call("whoami").await?;
    Ok(format!("Hello, {name}!"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    let router = Router::new()
        .with_handler("add", add)
        .with_handler("divide", divide)
        .with_handler("greet", greet);

    let app = Application::builder().with_router(router).build();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    tracing::info!(%address, "Calculator listening");

    let server = app.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let _ = server.accept(Framed::new(stream, JsonLinesCodec::new_with_max_length(1024 * 1024)));
        }
    });

    async fn whoami() -> Result<&'static str, anyhow::Error> {
        Ok("calculator example")
    }

    let (client, mut events) = Client::builder()
        .with_router(Router::new().with_handler("whoami", whoami))
        .connect(TcpLinesConnector::new(address.to_string()).with_max_line_length(1024 * 1024))?;
    client.opened().await?;

    let sum: f64 = client.call_with_params("add", [1, 2, 3]).await?;
    println!("1 + 2 + 3 = {sum}");

    let quotient: f64 = client
        .call_with_params("divide", json!({ "dividend": 1, "divisor": 4 }))
        .await?;
    println!("1 / 4 = {quotient}");

    match client
        .call_with_params::<_, f64>("divide", json!({ "dividend": 1, "divisor": 0 }))
        .await
    {
        Ok(_) => println!("1 / 0 somehow worked"),
        Err(e) => println!("1 / 0 failed: {e}"),
    }

    let greeting: String = client.call("greet").await?;
    println!("{greeting}");

    let notified = app.notify_all("display", json!({ "value": "goodbye" })).await;
    tracing::info!(notified, "Sent farewell");
    while let Some(event) = events.recv().await {
        if let RetryEvent::Notification(notification) = event {
            println!("Display notification: {:?}", notification.params);
            break;
        }
    }

    client.close().await;
    app.close().await;
    Ok(())
}
