//! An [`HttpClient`] over any tower service.
//!
//! [`ServiceClient`] turns a `tower::Service<Request<Body>>` (an `axum::Router`, a hyper client
//! wrapped in a service, a `service_fn`) into an observable client. Each call runs on a spawned
//! tokio task which, once the caller's handle is started, awaited or dropped:
//!
//! 1. emits `request` for every attempt,
//! 2. follows `3xx` responses carrying a `Location` header, emitting `redirect`,
//! 3. answers one `401` challenge with the configured bearer token, emitting `redirect`,
//! 4. emits `response` for the final response head,
//! 5. buffers the body and emits `complete` (or `error` on any failure),
//! 6. hands the outcome to the completion and to the handle's waiters.
//!
//! Redirects are followed by `tower_http`'s [`FollowRedirect`], which resolves relative
//! `Location` values and switches to `GET` where HTTP requires it.
//!
//! ## Options
//!
//! | key               | meaning                                                    |
//! |-------------------|------------------------------------------------------------|
//! | `baseUrl`         | prefix for relative targets                                |
//! | `uri` / `url`     | target when the call passes an options object              |
//! | `method`          | method for calls made without one (default `GET`)          |
//! | `headers`         | object of header names to values                           |
//! | `body`            | string body, or any JSON value sent as JSON                |
//! | `json`            | JSON value sent as the body when `body` is absent          |
//! | `followRedirect`  | follow redirects (default `true`)                          |
//! | `maxRedirects`    | redirect limit (default 10)                                |
//! | `timeout`         | per-attempt timeout in milliseconds                        |
//! | `auth.bearer`     | bearer token                                               |
//! | `auth.sendImmediately` | send the token up front (default) or only after a 401 |

use axum::body::Body;
use axum::http::{
    header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Service, ServiceExt};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};
use tower_http::follow_redirect::FollowRedirect;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::client::{
    merge_options, Capabilities, CompletedResponse, Completion, Dispatch, HttpClient,
    LifecycleEvent, Options, Outcome, RequestBody, RequestHandle, RequestState, ResponseHead,
    SharedClient, Target,
};
use crate::error::TransportError;

const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Observable HTTP client backed by a tower service.
///
/// Requests run on the current tokio runtime. Calls made outside a runtime fail with
/// [`TransportError::NoRuntime`] instead of panicking.
///
/// # Examples
///
/// ```rust,no_run
/// use axum::{routing::get, Router};
/// use request_debug::{DebugSession, ServiceClient};
/// use std::sync::Arc;
///
/// let app = Router::new().route("/hello", get(|| async { "Hello, World!" }));
/// let session = DebugSession::new(Arc::new(ServiceClient::new(app))).unwrap();
/// ```
#[derive(Clone)]
pub struct ServiceClient<S> {
    service: S,
    defaults: Options,
}

impl<S> ServiceClient<S> {
    pub fn new(service: S) -> Self {
        Self::with_defaults(service, Options::new())
    }

    pub fn with_defaults(service: S, defaults: Options) -> Self {
        Self { service, defaults }
    }

    /// Options bound into this client.
    pub fn default_options(&self) -> &Options {
        &self.defaults
    }
}

impl<S> fmt::Debug for ServiceClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl<S> HttpClient for ServiceClient<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    fn defaults(&self, options: &Options) -> Option<SharedClient> {
        Some(Arc::new(Self::with_defaults(
            self.service.clone(),
            merge_options(&self.defaults, options),
        )))
    }

    fn dispatch(&self, dispatch: Dispatch) -> RequestHandle {
        let Dispatch {
            method,
            target,
            options,
            completion,
            init,
        } = dispatch;

        let mut merged = merge_options(&self.defaults, &options);
        let explicit_uri = match target {
            Target::Uri(uri) => Some(uri),
            Target::Options(target_options) => {
                merged = merge_options(&merged, &target_options);
                None
            }
        };

        let fallback_method = plan_method(method.as_ref(), &merged);
        let plan = RequestPlan::new(method, explicit_uri, &merged);
        let state = match &plan {
            Ok(plan) => plan.initial_state(),
            Err(_) => RequestState::new(fallback_method, Uri::default()),
        };

        let (handle, start) = RequestHandle::deferred(state);
        let worker = handle.detached();
        init.run(&worker);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                settle(&worker, Err(TransportError::NoRuntime(e.to_string())), completion);
                return handle;
            }
        };

        let service = self.service.clone();
        runtime.spawn(async move {
            start.ready().await;
            let outcome = match plan {
                Ok(plan) => execute(service, &worker, plan).await,
                Err(e) => Err(e),
            };
            settle(&worker, outcome, completion);
        });

        handle
    }
}

/// Emit the terminal event, then hand the outcome to the completion and the waiters.
fn settle(handle: &RequestHandle, outcome: Outcome, completion: Option<Completion>) {
    match &outcome {
        Ok(response) => handle.emit(&LifecycleEvent::Complete(response)),
        Err(error) => {
            warn!(error = %error, "Request failed");
            handle.emit(&LifecycleEvent::Error(error));
        }
    }
    if let Some(completion) = completion {
        completion(outcome.clone());
    }
    handle.finish(outcome);
}

/// Everything needed to run one logical request, resolved from the merged options.
#[derive(Debug, Clone)]
struct RequestPlan {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: RequestBody,
    follow_redirects: bool,
    max_redirects: usize,
    timeout: Option<Duration>,
    bearer: Option<HeaderValue>,
}

fn plan_method(method: Option<&Method>, options: &Options) -> Method {
    method.cloned().unwrap_or_else(|| {
        options
            .get("method")
            .and_then(Value::as_str)
            .and_then(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
            .unwrap_or(Method::GET)
    })
}

impl RequestPlan {
    fn new(
        method: Option<Method>,
        explicit_uri: Option<String>,
        options: &Options,
    ) -> Result<Self, TransportError> {
        let method = plan_method(method.as_ref(), options);
        let uri = resolve_target(explicit_uri, options)?;

        let mut headers = HeaderMap::new();
        if let Some(Value::Object(configured)) = options.get("headers") {
            for (name, value) in configured {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| TransportError::RequestBuild(e.to_string()))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| TransportError::RequestBuild(e.to_string()))?;
                headers.insert(name, value);
            }
        }

        let body = match options.get("body").or_else(|| options.get("json")) {
            None | Some(Value::Null) | Some(Value::Bool(_)) => RequestBody::Empty,
            Some(Value::String(s)) => RequestBody::Buffered(Bytes::from(s.clone())),
            Some(json) => {
                headers
                    .entry(header::CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                RequestBody::Buffered(Bytes::from(json.to_string()))
            }
        };

        let auth = options.get("auth").and_then(Value::as_object);
        let bearer = auth
            .and_then(|a| a.get("bearer"))
            .and_then(Value::as_str)
            .map(|token| HeaderValue::from_str(&format!("Bearer {token}")))
            .transpose()
            .map_err(|e| TransportError::RequestBuild(e.to_string()))?;
        let send_immediately = auth
            .and_then(|a| a.get("sendImmediately"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let bearer = match bearer {
            Some(token) if send_immediately => {
                headers.insert(header::AUTHORIZATION, token);
                None
            }
            other => other,
        };

        Ok(Self {
            method,
            uri,
            headers,
            body,
            follow_redirects: options
                .get("followRedirect")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            max_redirects: options
                .get("maxRedirects")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MAX_REDIRECTS),
            timeout: options
                .get("timeout")
                .and_then(Value::as_u64)
                .map(Duration::from_millis),
            bearer,
        })
    }

    fn initial_state(&self) -> RequestState {
        let mut state = RequestState::new(self.method.clone(), self.uri.clone());
        state.headers = self.headers.clone();
        state.body = self.body.clone();
        state
    }
}

fn resolve_target(
    explicit_uri: Option<String>,
    options: &Options,
) -> Result<Uri, TransportError> {
    let target = explicit_uri
        .or_else(|| {
            options
                .get("uri")
                .or_else(|| options.get("url"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .ok_or_else(|| TransportError::InvalidUri {
            uri: String::new(),
            reason: "options.uri is a required argument".into(),
        })?;

    let full = match options.get("baseUrl").and_then(Value::as_str) {
        Some(base) => join_base(base, &target)?,
        None => target,
    };

    full.parse::<Uri>().map_err(|e| TransportError::InvalidUri {
        uri: full.clone(),
        reason: e.to_string(),
    })
}

/// Resolve `target` under `base`. The base acts as a prefix, so `http://h/api` joined with
/// `/users` is `http://h/api/users`; absolute and network-path targets replace it.
fn join_base(base: &str, target: &str) -> Result<String, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUri {
        uri: target.to_owned(),
        reason,
    };

    let mut base = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    let relative = match target.strip_prefix('/') {
        Some(rest) if !rest.starts_with('/') => rest,
        _ => target,
    };
    base.join(relative)
        .map(String::from)
        .map_err(|e| invalid(e.to_string()))
}

fn build_request(state: &RequestState) -> Result<Request<Body>, TransportError> {
    let mut builder = Request::builder()
        .method(state.method.clone())
        .uri(state.uri.clone());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(state.headers.clone());
    }
    let body = match &state.body {
        RequestBody::Buffered(bytes) => Body::from(bytes.clone()),
        RequestBody::Empty => Body::empty(),
    };
    builder
        .body(body)
        .map_err(|e| TransportError::RequestBuild(e.to_string()))
}

/// One attempt: mirrors the outgoing request into the handle's state, emits `request` and
/// records the response head. Sits below [`FollowRedirect`], so it sees every hop.
#[derive(Clone)]
struct Attempts<S> {
    service: S,
    handle: RequestHandle,
    timeout: Option<Duration>,
}

impl<S> Service<Request<Body>> for Attempts<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    type Response = Response<Body>;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, TransportError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        self.handle.update(|s| {
            // A method change on a redirect drops the body
            if s.method != *request.method() {
                s.body = RequestBody::Empty;
            }
            s.method = request.method().clone();
            s.uri = request.uri().clone();
            s.headers = request.headers().clone();
        });
        self.handle.emit(&LifecycleEvent::Request);
        debug!(method = %request.method(), uri = %request.uri(), "Sending request");

        let handle = self.handle.clone();
        let timeout = self.timeout;
        let call = self.service.clone().oneshot(request);
        Box::pin(async move {
            let result = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, call)
                    .await
                    .map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))?,
                None => call.await,
            };
            let response = result.map_err(|e| TransportError::Service(e.to_string()))?;

            let head = ResponseHead {
                status: response.status(),
                headers: response.headers().clone(),
            };
            debug!(status = %head.status, "Response head received");
            handle.update(|s| s.response = Some(head));
            Ok(response)
        })
    }
}

/// Redirect policy that counts hops across the whole logical request and emits `redirect`
/// for each one it follows.
#[derive(Clone)]
struct ObservedRedirects {
    handle: RequestHandle,
    follow: bool,
    max_redirects: usize,
    followed: Arc<AtomicUsize>,
    body: Option<Bytes>,
}

impl Policy<Body, TransportError> for ObservedRedirects {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, TransportError> {
        if !self.follow {
            return Ok(Action::Stop);
        }
        let followed = self.followed.fetch_add(1, Ordering::SeqCst) + 1;
        if followed > self.max_redirects {
            return Err(TransportError::TooManyRedirects(self.max_redirects));
        }

        let head = self.handle.state().response.unwrap_or_else(|| ResponseHead {
            status: attempt.status(),
            headers: HeaderMap::new(),
        });
        let next = attempt.location().clone();
        debug!(
            status = %attempt.status(),
            previous = %attempt.previous(),
            next = %next,
            "Following redirect"
        );
        self.handle.update(|s| s.uri = next);
        self.handle.emit(&LifecycleEvent::Redirect(&head));
        Ok(Action::Follow)
    }

    fn clone_body(&self, _body: &Body) -> Option<Body> {
        // 307/308 resend the original payload
        self.body.clone().map(Body::from)
    }
}

#[instrument(skip_all, fields(method = %plan.method, uri = %plan.uri))]
async fn execute<S>(service: S, handle: &RequestHandle, plan: RequestPlan) -> Outcome
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    let body = match &plan.body {
        RequestBody::Buffered(bytes) => Some(bytes.clone()),
        RequestBody::Empty => None,
    };
    let hops = FollowRedirect::with_policy(
        Attempts {
            service,
            handle: handle.clone(),
            timeout: plan.timeout,
        },
        ObservedRedirects {
            handle: handle.clone(),
            follow: plan.follow_redirects,
            max_redirects: plan.max_redirects,
            followed: Arc::new(AtomicUsize::new(0)),
            body,
        },
    );

    let mut challenged = false;
    loop {
        let request = build_request(&handle.state())?;
        let response = hops.clone().oneshot(request).await?;

        let (parts, body) = response.into_parts();
        let head = ResponseHead {
            status: parts.status,
            headers: parts.headers,
        };

        if head.status == StatusCode::UNAUTHORIZED && !challenged {
            if let Some(token) = &plan.bearer {
                challenged = true;
                debug!("Answering auth challenge with bearer token");
                handle.update(|s| {
                    s.headers.insert(header::AUTHORIZATION, token.clone());
                });
                handle.emit(&LifecycleEvent::Redirect(&head));
                continue;
            }
        }

        handle.emit(&LifecycleEvent::Response(&head));

        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?
            .to_bytes();
        return Ok(CompletedResponse {
            status: head.status,
            headers: head.headers,
            body,
        });
    }
}
