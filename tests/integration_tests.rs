use axum::{
    body::Body,
    extract::RawQuery,
    http::{header, HeaderMap, Method, Request, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{future::join_all, stream};
use request_debug::{
    types::*, Completion, DebugConfig, DebugError, DebugSession, Dispatch, EventKind, LogSink,
    Options, Outcome, ServiceClient, Target, TransportError,
};
use serde_json::{json, Value};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::sleep;

/// Test sink that collects every record for verification
#[derive(Debug, Clone, Default)]
struct Recorder {
    records: Arc<Mutex<Vec<(RecordKind, LogRecord)>>>,
}

impl Recorder {
    fn records(&self) -> Vec<(RecordKind, LogRecord)> {
        self.records.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<RecordKind> {
        self.records().into_iter().map(|(kind, _)| kind).collect()
    }

    fn ids(&self) -> Vec<DebugId> {
        self.records().iter().map(|(_, r)| r.debug_id()).collect()
    }
}

impl LogSink for Recorder {
    fn log(&self, kind: RecordKind, record: &LogRecord) {
        self.records.lock().unwrap().push((kind, record.clone()));
    }
}

// Test server handlers
async fn hello_handler() -> impl IntoResponse {
    "Hello, World!"
}

async fn json_handler() -> impl IntoResponse {
    Json(json!({ "key": "value" }))
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn redirect_handler() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/bottom")])
}

async fn bottom_handler() -> impl IntoResponse {
    "Made it to the bottom"
}

async fn network_path_handler() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "//other.example/landing")])
}

async fn landing_handler() -> impl IntoResponse {
    "Landed"
}

async fn list_handler(RawQuery(query): RawQuery) -> Response<Body> {
    match query {
        Some(query) => format!("listing {query}").into_response(),
        None => (StatusCode::FOUND, [(header::LOCATION, "?page=2")]).into_response(),
    }
}

async fn down_handler() -> impl IntoResponse {
    (StatusCode::SEE_OTHER, [(header::LOCATION, "../up")])
}

async fn up_handler() -> impl IntoResponse {
    "Up one level"
}

async fn loop_handler() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/loop")])
}

async fn secret_handler(headers: HeaderMap) -> Response<Body> {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer t0k");
    if authorized {
        "Welcome".into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"test\"")],
        )
            .into_response()
    }
}

async fn delayed_handler() -> impl IntoResponse {
    sleep(Duration::from_millis(200)).await;
    "Delayed response"
}

async fn streaming_handler() -> impl IntoResponse {
    let stream = stream::iter(vec![
        Ok::<_, std::convert::Infallible>(Bytes::from("chunk1")),
        Ok(Bytes::from("chunk2")),
        Ok(Bytes::from("chunk3")),
    ]);

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn create_test_app() -> Router {
    Router::new()
        .route("/hello", get(hello_handler))
        .route("/json", get(json_handler))
        .route("/echo", post(echo_handler))
        .route("/redirect", get(redirect_handler))
        .route("/bottom", get(bottom_handler))
        .route("/net", get(network_path_handler))
        .route("/landing", get(landing_handler))
        .route("/list", get(list_handler))
        .route("/a/b/down", get(down_handler))
        .route("/a/up", get(up_handler))
        .route("/loop", get(loop_handler))
        .route("/secret", get(secret_handler))
        .route("/delayed", get(delayed_handler))
        .route("/streaming", get(streaming_handler))
}

fn create_session(recorder: &Recorder) -> DebugSession {
    let session = DebugSession::new(Arc::new(ServiceClient::new(create_test_app()))).unwrap();
    session.set_logger(recorder.clone());
    session
}

fn opts(value: Value) -> Options {
    value.as_object().cloned().unwrap()
}

fn done() -> Option<Completion> {
    Some(Box::new(|_: Outcome| {}))
}

#[tokio::test]
async fn test_buffered_json_response() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let handle = session.get("http://localhost/json", Options::new(), done());
    let response = handle.wait().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json::<Value>().unwrap(), json!({ "key": "value" }));

    let records = recorder.records();
    assert_eq!(records.len(), 2);

    let (kind, LogRecord::Request(request)) = &records[0] else {
        panic!("expected a request record, got {:?}", records[0]);
    };
    assert_eq!(*kind, RecordKind::Request);
    assert_eq!(request.debug_id, 1);
    assert_eq!(request.uri, "http://localhost/json");
    assert_eq!(request.method, "GET");
    assert!(request.body.is_none());

    let (kind, LogRecord::Response(response)) = &records[1] else {
        panic!("expected a response record, got {:?}", records[1]);
    };
    assert_eq!(*kind, RecordKind::Response);
    assert_eq!(response.debug_id, 1);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["content-type"], "application/json");
    assert_eq!(response.body, Some(json!({ "key": "value" })));
}

#[tokio::test]
async fn test_redirect_chain_shares_debug_id() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let response = session
        .get("http://localhost/redirect", Options::new(), done())
        .wait()
        .await
        .unwrap();
    assert_eq!(response.text(), "Made it to the bottom");

    assert_eq!(
        recorder.kinds(),
        vec![
            RecordKind::Request,
            RecordKind::Redirect,
            RecordKind::Request,
            RecordKind::Response
        ]
    );
    assert_eq!(recorder.ids(), vec![1, 1, 1, 1]);

    let records = recorder.records();
    let LogRecord::Redirect(redirect) = &records[1].1 else {
        panic!("expected a redirect record, got {:?}", records[1]);
    };
    assert_eq!(redirect.status_code, 302);
    assert_eq!(redirect.uri, "http://localhost/bottom");
    assert_eq!(redirect.headers["location"], "/bottom");

    let LogRecord::Request(follow_up) = &records[2].1 else {
        panic!("expected a request record, got {:?}", records[2]);
    };
    assert_eq!(follow_up.uri, "http://localhost/bottom");
}

/// Follows one redirect from `uri` and returns the next-hop uri and the final body.
async fn follow_once(uri: &str) -> (String, String) {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let response = session
        .get(uri, Options::new(), done())
        .wait()
        .await
        .unwrap();
    assert_eq!(
        recorder.kinds(),
        vec![
            RecordKind::Request,
            RecordKind::Redirect,
            RecordKind::Request,
            RecordKind::Response
        ]
    );

    let records = recorder.records();
    let LogRecord::Redirect(redirect) = &records[1].1 else {
        panic!("expected a redirect record, got {:?}", records[1]);
    };
    let LogRecord::Request(follow_up) = &records[2].1 else {
        panic!("expected a request record, got {:?}", records[2]);
    };
    assert_eq!(follow_up.uri, redirect.uri);
    (redirect.uri.clone(), response.text())
}

#[tokio::test]
async fn test_network_path_location_changes_host() {
    let (next, body) = follow_once("http://localhost/net").await;
    assert_eq!(next, "http://other.example/landing");
    assert_eq!(body, "Landed");
}

#[tokio::test]
async fn test_query_only_location_keeps_path() {
    let (next, body) = follow_once("http://localhost/list").await;
    assert_eq!(next, "http://localhost/list?page=2");
    assert_eq!(body, "listing page=2");
}

#[tokio::test]
async fn test_dot_segment_location_is_resolved() {
    let (next, body) = follow_once("http://localhost/a/b/down").await;
    assert_eq!(next, "http://localhost/a/up");
    assert_eq!(body, "Up one level");
}

#[tokio::test]
async fn test_relative_target_under_base_url() {
    let recorder = Recorder::default();
    let client = ServiceClient::with_defaults(
        create_test_app(),
        opts(json!({ "baseUrl": "http://localhost/a/b/" })),
    );
    let session = DebugSession::new(Arc::new(client)).unwrap();
    session.set_logger(recorder.clone());

    let response = session
        .get("../up", Options::new(), done())
        .wait()
        .await
        .unwrap();
    assert_eq!(response.text(), "Up one level");

    let records = recorder.records();
    let LogRecord::Request(request) = &records[0].1 else {
        panic!("expected a request record");
    };
    assert_eq!(request.uri, "http://localhost/a/up");
}

#[tokio::test]
async fn test_redirect_limit_is_an_error() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let outcome = session
        .get(
            "http://localhost/loop",
            opts(json!({ "maxRedirects": 2 })),
            done(),
        )
        .wait()
        .await;
    assert_eq!(outcome.unwrap_err(), TransportError::TooManyRedirects(2));
    assert_eq!(
        recorder.kinds(),
        vec![
            RecordKind::Request,
            RecordKind::Redirect,
            RecordKind::Request,
            RecordKind::Redirect,
            RecordKind::Request,
            RecordKind::Error
        ]
    );
}

#[tokio::test]
async fn test_redirects_not_followed_when_disabled() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let response = session
        .get(
            "http://localhost/redirect",
            opts(json!({ "followRedirect": false })),
            done(),
        )
        .wait()
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(
        recorder.kinds(),
        vec![RecordKind::Request, RecordKind::Response]
    );
}

#[tokio::test]
async fn test_bearer_challenge_is_tagged_auth() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let response = session
        .get(
            "http://localhost/secret",
            opts(json!({ "auth": { "bearer": "t0k", "sendImmediately": false } })),
            done(),
        )
        .wait()
        .await
        .unwrap();
    assert_eq!(response.text(), "Welcome");

    assert_eq!(
        recorder.kinds(),
        vec![
            RecordKind::Request,
            RecordKind::Auth,
            RecordKind::Request,
            RecordKind::Response
        ]
    );

    let records = recorder.records();
    let LogRecord::Request(first) = &records[0].1 else {
        panic!("expected a request record");
    };
    assert!(!first.headers.contains_key("authorization"));

    let LogRecord::Redirect(challenge) = &records[1].1 else {
        panic!("expected an auth record");
    };
    assert_eq!(challenge.status_code, 401);
    assert_eq!(challenge.uri, "http://localhost/secret");

    let LogRecord::Request(retry) = &records[2].1 else {
        panic!("expected a request record");
    };
    assert_eq!(retry.headers["authorization"], "Bearer t0k");
}

#[tokio::test]
async fn test_streamed_response_has_no_body() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    // No completion: the caller consumes the response itself
    let handle = session.get("http://localhost/streaming", Options::new(), None);
    let response = handle.wait().await.unwrap();
    assert_eq!(response.text(), "chunk1chunk2chunk3");

    let records = recorder.records();
    assert_eq!(
        recorder.kinds(),
        vec![RecordKind::Request, RecordKind::Response]
    );
    let LogRecord::Response(record) = &records[1].1 else {
        panic!("expected a response record");
    };
    assert_eq!(record.status_code, 200);
    assert!(record.body.is_none());
}

#[tokio::test]
async fn test_buffered_streaming_body_is_captured_whole() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    session
        .get("http://localhost/streaming", Options::new(), done())
        .wait()
        .await
        .unwrap();

    let records = recorder.records();
    let responses: Vec<_> = records
        .iter()
        .filter(|(kind, _)| *kind == RecordKind::Response)
        .collect();
    assert_eq!(responses.len(), 1);
    let LogRecord::Response(record) = &responses[0].1 else {
        panic!("expected a response record");
    };
    assert_eq!(record.body, Some(json!("chunk1chunk2chunk3")));
}

#[tokio::test]
async fn test_request_body_capture() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let received = Arc::new(Mutex::new(None));
    let slot = received.clone();
    let handle = session.post(
        "http://localhost/echo",
        opts(json!({ "body": "Hello, World!" })),
        Some(Box::new(move |outcome: Outcome| {
            *slot.lock().unwrap() = Some(outcome.map(|r| r.text()));
        })),
    );
    handle.wait().await.unwrap();

    assert_eq!(
        received.lock().unwrap().clone(),
        Some(Ok("Echo: Hello, World!".to_string()))
    );

    let records = recorder.records();
    let LogRecord::Request(request) = &records[0].1 else {
        panic!("expected a request record");
    };
    assert_eq!(request.method, "POST");
    assert_eq!(request.body.as_deref(), Some("Hello, World!"));

    let LogRecord::Response(response) = &records[1].1 else {
        panic!("expected a response record");
    };
    assert_eq!(response.body, Some(json!("Echo: Hello, World!")));
}

#[tokio::test]
async fn test_generic_request_takes_method_from_options() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let target = Target::Options(opts(json!({
        "uri": "http://localhost/echo",
        "method": "POST",
        "json": { "a": 1 }
    })));
    let response = session.request(target, done()).wait().await.unwrap();
    assert_eq!(response.text(), r#"Echo: {"a":1}"#);

    let records = recorder.records();
    let LogRecord::Request(request) = &records[0].1 else {
        panic!("expected a request record");
    };
    assert_eq!(request.method, "POST");
    assert_eq!(request.headers["content-type"], "application/json");
    assert_eq!(request.body.as_deref(), Some(r#"{"a":1}"#));
}

#[tokio::test]
async fn test_transport_error_is_observed_and_propagated() {
    let recorder = Recorder::default();
    let failing = tower::service_fn(|_req: Request<Body>| async {
        Err::<Response<Body>, _>("connection refused")
    });
    let session = DebugSession::new(Arc::new(ServiceClient::new(failing))).unwrap();
    session.set_logger(recorder.clone());

    let received = Arc::new(Mutex::new(None));
    let slot = received.clone();
    let outcome = session
        .get(
            "http://localhost/hello",
            Options::new(),
            Some(Box::new(move |outcome: Outcome| {
                *slot.lock().unwrap() = Some(outcome);
            })),
        )
        .wait()
        .await;

    let expected = TransportError::Service("connection refused".into());
    assert_eq!(outcome.unwrap_err(), expected);
    assert_eq!(received.lock().unwrap().clone(), Some(Err(expected)));

    let records = recorder.records();
    assert_eq!(recorder.kinds(), vec![RecordKind::Request, RecordKind::Error]);
    let LogRecord::Error(error) = &records[1].1 else {
        panic!("expected an error record");
    };
    assert_eq!(error.debug_id, 1);
    assert_eq!(error.error, "Transport error: connection refused");
    assert_eq!(error.method, "GET");
    assert_eq!(error.uri, "http://localhost/hello");
}

#[tokio::test]
async fn test_timeout_is_recorded_as_error() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let outcome = session
        .get(
            "http://localhost/delayed",
            opts(json!({ "timeout": 20 })),
            done(),
        )
        .wait()
        .await;
    assert_eq!(outcome.unwrap_err(), TransportError::Timeout(20));
    assert_eq!(recorder.kinds(), vec![RecordKind::Request, RecordKind::Error]);
}

#[tokio::test]
async fn test_multiple_concurrent_requests() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let handles: Vec<_> = (0..5)
        .map(|i| {
            session.post(
                "http://localhost/echo",
                opts(json!({ "body": format!("Request {i}") })),
                done(),
            )
        })
        .collect();

    // Wait for all requests to complete concurrently
    let outcomes = join_all(handles.iter().map(|h| h.wait())).await;
    for (i, outcome) in outcomes.into_iter().enumerate() {
        assert_eq!(outcome.unwrap().text(), format!("Echo: Request {i}"));
    }

    let records = recorder.records();
    assert_eq!(records.len(), 10);

    // Ids are 1..=5, each used by exactly one request/response pair
    let ids: HashSet<_> = recorder.ids().into_iter().collect();
    assert_eq!(ids, (1..=5).collect());

    for id in 1..=5 {
        let request_body = records.iter().find_map(|(_, r)| match r {
            LogRecord::Request(req) if req.debug_id == id => req.body.clone(),
            _ => None,
        });
        let response_body = records.iter().find_map(|(_, r)| match r {
            LogRecord::Response(resp) if resp.debug_id == id => resp.body.clone(),
            _ => None,
        });
        let request_body = request_body.unwrap();
        assert_eq!(response_body, Some(json!(format!("Echo: {request_body}"))));
    }
}

#[tokio::test]
async fn test_sequential_ids() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    for _ in 0..3 {
        session
            .get("http://localhost/hello", Options::new(), done())
            .wait()
            .await
            .unwrap();
    }
    assert_eq!(recorder.ids(), vec![1, 1, 2, 2, 3, 3]);
}

#[tokio::test]
async fn test_suspended_requests_pass_through() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    session.suspend();
    let response = session
        .get("http://localhost/hello", Options::new(), done())
        .wait()
        .await
        .unwrap();
    assert_eq!(response.text(), "Hello, World!");
    assert!(recorder.records().is_empty());
    assert_eq!(session.peek_next_id(), 1);

    session.resume();
    session
        .get("http://localhost/hello", Options::new(), done())
        .wait()
        .await
        .unwrap();
    assert_eq!(recorder.ids(), vec![1, 1]);
}

#[tokio::test]
async fn test_derived_session_inherits_state() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);
    session.suspend();

    let child = session
        .derive(opts(json!({ "baseUrl": "http://localhost" })))
        .unwrap();
    assert!(!child.is_capturing());
    assert!(Arc::ptr_eq(&child.logger(), &session.logger()));

    // Independent after derivation
    child.resume();
    assert!(!session.is_capturing());

    let response = child
        .get("/hello", Options::new(), done())
        .wait()
        .await
        .unwrap();
    assert_eq!(response.text(), "Hello, World!");

    let records = recorder.records();
    let LogRecord::Request(request) = &records[0].1 else {
        panic!("expected a request record");
    };
    assert_eq!(request.debug_id, 1);
    assert_eq!(request.uri, "http://localhost/hello");
}

#[tokio::test]
async fn test_unwrapped_client_is_not_observed() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let raw = session.into_inner();
    let handle = raw.dispatch(
        Dispatch::new(Some(Method::GET), "http://localhost/hello").with_completion(|_| {}),
    );
    assert_eq!(handle.wait().await.unwrap().text(), "Hello, World!");
    assert_eq!(handle.listener_count(), 0);
    assert!(recorder.records().is_empty());
}

#[tokio::test]
async fn test_wrapping_a_session_twice_observes_once() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let rewrapped = DebugSession::new(Arc::new(session.clone())).unwrap();
    rewrapped
        .get("http://localhost/hello", Options::new(), done())
        .wait()
        .await
        .unwrap();

    assert_eq!(
        recorder.kinds(),
        vec![RecordKind::Request, RecordKind::Response]
    );
    assert_eq!(recorder.ids(), vec![1, 1]);
}

#[tokio::test]
async fn test_unknown_logger_is_rejected() {
    let config = DebugConfig {
        logger: "console".into(),
        ..DebugConfig::default()
    };
    let err = DebugSession::with_config(
        Arc::new(ServiceClient::new(create_test_app())),
        Options::new(),
        config,
    )
    .unwrap_err();

    assert_eq!(err, DebugError::InvalidLogger("console".into()));
    assert!(err.to_string().contains("Logger must be"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_caller_listeners_see_every_event() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let handle = session.get("http://localhost/hello", Options::new(), None);
    // Give a worker thread the chance to run the request early
    std::thread::sleep(Duration::from_millis(50));

    let seen = Arc::new(AtomicUsize::new(0));
    for kind in [EventKind::Request, EventKind::Response] {
        let seen = seen.clone();
        handle.on(kind, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    handle.wait().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(
        recorder.kinds(),
        vec![RecordKind::Request, RecordKind::Response]
    );
}

#[tokio::test]
async fn test_dropped_handle_still_completes() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let (tx, rx) = tokio::sync::oneshot::channel();
    drop(session.get(
        "http://localhost/hello",
        Options::new(),
        Some(Box::new(move |outcome: Outcome| {
            let _ = tx.send(outcome);
        })),
    ));

    let response = rx.await.unwrap().unwrap();
    assert_eq!(response.text(), "Hello, World!");
    assert_eq!(recorder.ids(), vec![1, 1]);
}

#[test]
fn test_call_outside_runtime_fails_with_error_record() {
    let recorder = Recorder::default();
    let session = create_session(&recorder);

    let handle = session.get("http://localhost/hello", Options::new(), done());

    assert_eq!(recorder.kinds(), vec![RecordKind::Error]);
    assert!(matches!(
        handle.outcome(),
        Some(Err(TransportError::NoRuntime(_)))
    ));
}
