use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use request_debug::{
    types::*, DebugConfig, DebugSession, IdScope, MultiSink, Options, Outcome, ServiceClient,
    StderrSink, TracingSink,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::sleep;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Summary of one logical request, assembled from the records that share its debug id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CapturedExchange {
    debug_id: u64,
    method: String,
    uri: String,
    attempts: usize,
    redirects: Vec<String>,
    status: Option<u16>,
    body: Option<serde_json::Value>,
    error: Option<String>,
}

/// Sink that keeps a per-request summary in memory for demonstration
#[derive(Debug, Clone, Default)]
struct SummarySink {
    exchanges: Arc<Mutex<Vec<CapturedExchange>>>,
}

impl SummarySink {
    fn exchanges(&self) -> Vec<CapturedExchange> {
        self.exchanges.lock().unwrap().clone()
    }

    fn record(&self, kind: RecordKind, record: &LogRecord) {
        let mut exchanges = self.exchanges.lock().unwrap();
        let debug_id = record.debug_id();
        let index = match exchanges.iter().position(|e| e.debug_id == debug_id) {
            Some(index) => index,
            None => {
                exchanges.push(CapturedExchange {
                    debug_id,
                    ..Default::default()
                });
                exchanges.len() - 1
            }
        };
        let exchange = &mut exchanges[index];

        match record {
            LogRecord::Request(r) => {
                if exchange.attempts == 0 {
                    exchange.method = r.method.clone();
                    exchange.uri = r.uri.clone();
                }
                exchange.attempts += 1;
            }
            LogRecord::Redirect(r) => {
                exchange.redirects.push(format!("{kind} {} -> {}", r.status_code, r.uri));
            }
            LogRecord::Response(r) => {
                exchange.status = Some(r.status_code);
                exchange.body = r.body.clone();
            }
            LogRecord::Error(r) => exchange.error = Some(r.error.clone()),
        }
    }
}

// Handlers for the in-process demo server
async fn hello_handler() -> impl IntoResponse {
    sleep(Duration::from_millis(100)).await; // Simulate some work
    "Hello, World!"
}

async fn json_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "key": "value" }))
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    sleep(Duration::from_millis(50)).await; // Simulate some work
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn old_handler() -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/json")])
}

async fn streaming_handler() -> impl IntoResponse {
    use futures::stream;
    use tokio::time::interval;

    let stream = stream::unfold(0u32, |count| async move {
        if count >= 5 {
            None
        } else {
            let mut interval = interval(Duration::from_millis(200));
            interval.tick().await;
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(format!("chunk-{count}\n"))),
                count + 1,
            ))
        }
    });

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn print_outcome(label: &'static str) -> Option<request_debug::Completion> {
    Some(Box::new(move |outcome: Outcome| match outcome {
        Ok(response) => info!("{label}: {} ({} bytes)", response.status, response.body.len()),
        Err(e) => info!("{label}: failed with {e}"),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    info!("Starting request debugging demo");

    let app = Router::new()
        .route("/hello", get(hello_handler))
        .route("/json", get(json_handler))
        .route("/echo", post(echo_handler))
        .route("/old", get(old_handler))
        .route("/streaming", get(streaming_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        );

    let mut defaults = Options::new();
    defaults.insert("baseUrl".into(), "http://demo.local".into());
    // Global ids so the derived session below does not restart at 1
    let config = DebugConfig {
        id_scope: IdScope::Global,
        ..DebugConfig::default()
    };
    let session = DebugSession::with_config(Arc::new(ServiceClient::new(app)), defaults, config)?;

    let summary = SummarySink::default();
    let recorder = summary.clone();
    session.set_logger(
        MultiSink::new()
            .with(TracingSink)
            .with(StderrSink)
            .with(move |kind: RecordKind, record: &LogRecord| recorder.record(kind, record)),
    );

    info!("Buffered GET, redirected once");
    session
        .get("/old", Options::new(), print_outcome("GET /old"))
        .wait()
        .await?;

    info!("Buffered POST with a body");
    let mut echo = Options::new();
    echo.insert("body".into(), "Hello from the demo".into());
    session
        .post("/echo", echo, print_outcome("POST /echo"))
        .wait()
        .await?;

    info!("Streamed GET: the response is recorded without its body");
    session.get("/streaming", Options::new(), None).wait().await?;

    info!("Suspended GET: not recorded");
    session.suspend();
    session
        .get("/hello", Options::new(), print_outcome("GET /hello"))
        .wait()
        .await?;
    session.resume();

    info!("Derived session with extra headers");
    let mut traced = Options::new();
    traced.insert(
        "headers".into(),
        serde_json::json!({ "x-demo": "derived" }),
    );
    let child = session.derive(traced)?;
    child
        .get("/json", Options::new(), print_outcome("GET /json"))
        .wait()
        .await?;

    info!("Captured exchanges:");
    for exchange in summary.exchanges() {
        info!("{}", serde_json::to_string(&exchange)?);
    }

    Ok(())
}
