use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use wexx_rpc::{
    Application, ApplicationConfig, ConnectionHandle, Context, ErrorDetails, Extension, JsonRpcError, Middleware,
    Next, Params, Router, async_trait,
};

/// Calculator memory shared by every connection to the test service
#[derive(Clone, Debug, Default)]
pub struct Memory(Arc<Mutex<Option<f64>>>);

impl Memory {
    pub fn get(&self) -> Option<f64> {
        *self.0.lock().unwrap()
    }
}

/// Names of every method that went through the pipeline, in order
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn methods(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Records every request in the [`CallLog`] and refuses `admin.*` methods outright.
struct Gatekeeper {
    log: CallLog,
}

#[async_trait]
impl Middleware for Gatekeeper {
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> anyhow::Result<()> {
        self.log.0.lock().unwrap().push(cx.method().to_string());

        if cx.method().starts_with("admin.") {
            cx.set_error(ErrorDetails::server_error(-32001, "Forbidden", None))?;
            return Ok(());
        }

        next.run(cx).await
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DivideParams {
    pub dividend: f64,
    pub divisor: f64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StoreParams {
    pub value: f64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ConfirmParams {
    pub question: String,
}

/// Everything the service exposes
pub fn calculator_router() -> Router {
    Router::new()
        .with_handler("add", add)
        .with_handler("divide", divide)
        .with_handler("store", store)
        .with_handler("recall", recall)
        .with_handler("clear_with_confirmation", clear_with_confirmation)
        .with_handler("explode", explode)
}

/// Build the test service, returning the shared state alongside so tests can inspect it
pub fn calculator_app(config: ApplicationConfig) -> (Application, Memory, CallLog) {
    let memory = Memory::default();
    let log = CallLog::default();

    let app = Application::builder()
        .with_config(config)
        .with_middleware(Gatekeeper { log: log.clone() })
        .with_extension(memory.clone())
        .with_router(calculator_router())
        .build();

    (app, memory, log)
}

async fn add(Params(numbers): Params<Vec<f64>>) -> Result<f64, anyhow::Error> {
    Ok(numbers.into_iter().sum())
}

async fn divide(Params(DivideParams { dividend, divisor }): Params<DivideParams>) -> Result<f64, ErrorDetails> {
    if divisor == 0.0 {
        return Err(ErrorDetails::application(
            "Division by zero",
            serde_json::json!({ "dividend": dividend }),
        ));
    }
    Ok(dividend / divisor)
}

async fn store(
    Extension(memory): Extension<Memory>,
    Params(StoreParams { value }): Params<StoreParams>,
) -> Result<(), anyhow::Error> {
    *memory.0.lock().unwrap() = Some(value);
    Ok(())
}

async fn recall(Extension(memory): Extension<Memory>) -> Result<Option<f64>, anyhow::Error> {
    Ok(memory.get())
}

/// Asks the caller for permission before clearing the memory, by calling the caller's `confirm`
/// method over the same connection.
async fn clear_with_confirmation(
    Extension(memory): Extension<Memory>,
    connection: ConnectionHandle,
) -> Result<bool, JsonRpcError> {
    let confirmed: bool = connection
        .call_with_params(
            "confirm",
            ConfirmParams {
                question: "Clear the memory?".to_string(),
            },
        )
        .await?;

    if confirmed {
        *memory.0.lock().unwrap() = None;
    }
    Ok(confirmed)
}

async fn explode() -> Result<(), anyhow::Error> {
    panic!("the calculator caught fire");
}
