//! The contract between a debug session and the HTTP client it observes.
//!
//! A client declares what it can do through [`Capabilities`], binds default options through
//! [`HttpClient::defaults`] and executes calls through [`HttpClient::dispatch`]. Every dispatched
//! call produces a [`RequestHandle`], which is the per-request event emitter: the client mutates
//! the handle's [`RequestState`] as the request progresses and emits [`LifecycleEvent`]s on it.
//!
//! Before the client starts any I/O it must run the dispatch's [`InitChain`] against the new
//! handle. This is where observers attach their listeners, so no event can be missed.

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};

use crate::error::TransportError;
use crate::subscription::SubscriptionKey;
use crate::DebugSession;

/// Options bound into a client or passed along with a single call.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Shallow merge where keys in `overrides` replace keys in `base`.
pub fn merge_options(base: &Options, overrides: &Options) -> Options {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// What a client is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// The client can produce a derived client with default options bound in
    pub bind_defaults: bool,
    /// The client accepts calls with an explicit method
    pub verbs: bool,
    /// The client accepts calls without a method
    pub generic: bool,
}

impl Capabilities {
    pub const FULL: Capabilities = Capabilities {
        bind_defaults: true,
        verbs: true,
        generic: true,
    };

    pub fn can_dispatch(&self) -> bool {
        self.verbs || self.generic
    }
}

/// What a call is aimed at: a bare URI, or an options object carrying `uri`/`url`.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Uri(String),
    Options(Options),
}

impl From<&str> for Target {
    fn from(uri: &str) -> Self {
        Target::Uri(uri.to_owned())
    }
}

impl From<String> for Target {
    fn from(uri: String) -> Self {
        Target::Uri(uri)
    }
}

impl From<&Uri> for Target {
    fn from(uri: &Uri) -> Self {
        Target::Uri(uri.to_string())
    }
}

impl From<Options> for Target {
    fn from(options: Options) -> Self {
        Target::Options(options)
    }
}

/// Final result of a logical request.
pub type Outcome = Result<CompletedResponse, TransportError>;

/// Continuation invoked once with the buffered outcome of a call.
pub type Completion = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// A hook run against every new request handle before the request starts.
pub type InitHook = Arc<dyn Fn(&RequestHandle) + Send + Sync>;

/// Ordered hooks run on each new request handle.
///
/// Hooks are only ever appended, so whatever was registered before an observer joined keeps
/// running. Keyed hooks are registered at most once per key.
#[derive(Clone, Default)]
pub struct InitChain {
    hooks: Vec<(Option<SubscriptionKey>, InitHook)>,
}

impl InitChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: InitHook) {
        self.hooks.push((None, hook));
    }

    /// Append a hook owned by `key`. Returns `false` and leaves the chain untouched when a hook
    /// with the same key is already present.
    pub fn push_keyed(&mut self, key: SubscriptionKey, hook: InitHook) -> bool {
        if self.contains(key) {
            return false;
        }
        self.hooks.push((Some(key), hook));
        true
    }

    pub fn contains(&self, key: SubscriptionKey) -> bool {
        self.hooks.iter().any(|(k, _)| *k == Some(key))
    }

    pub fn run(&self, handle: &RequestHandle) {
        for (_, hook) in &self.hooks {
            hook(handle);
        }
    }
}

impl fmt::Debug for InitChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitChain")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// A single call handed to [`HttpClient::dispatch`].
pub struct Dispatch {
    /// `None` for a generic call; the client picks the method from the options
    pub method: Option<Method>,
    pub target: Target,
    pub options: Options,
    /// Present when the caller wants the buffered outcome
    pub completion: Option<Completion>,
    pub init: InitChain,
}

impl Dispatch {
    pub fn new(method: Option<Method>, target: impl Into<Target>) -> Self {
        Self {
            method,
            target: target.into(),
            options: Options::new(),
            completion: None,
            init: InitChain::new(),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_completion(mut self, completion: impl FnOnce(Outcome) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn with_init(mut self, init: InitChain) -> Self {
        self.init = init;
        self
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("options", &self.options)
            .field("completion", &self.completion.is_some())
            .field("init", &self.init)
            .finish()
    }
}

/// An HTTP client that can be observed by a [`DebugSession`].
pub trait HttpClient: Send + Sync + 'static {
    /// Declared capabilities, checked when a session is constructed.
    fn capabilities(&self) -> Capabilities;

    /// Produce a derived client with `options` bound as defaults, or `None` if this client
    /// cannot produce derivatives.
    fn defaults(&self, options: &Options) -> Option<SharedClient>;

    /// Start a call. The client must run `dispatch.init` on the returned handle before any
    /// lifecycle event is emitted, and must hand the outcome to the completion (if any) and to
    /// [`RequestHandle::finish`].
    fn dispatch(&self, dispatch: Dispatch) -> RequestHandle;

    /// The session this client already is, if it is one.
    fn debug_session(&self) -> Option<DebugSession> {
        None
    }
}

pub type SharedClient = Arc<dyn HttpClient>;

/// Request body as known at the time the request is sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Fully buffered payload
    Buffered(Bytes),
}

/// Status line and headers of a received response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// A response with its body fully buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CompletedResponse {
    pub fn head(&self) -> ResponseHead {
        ResponseHead {
            status: self.status,
            headers: self.headers.clone(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Mutable state of one in-flight request.
///
/// The client updates it as the request progresses: on a redirect `uri` already holds the next
/// target and `response` the response that caused the redirect.
#[derive(Debug, Clone)]
pub struct RequestState {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Most recent response head received for this request
    pub response: Option<ResponseHead>,
}

impl RequestState {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            response: None,
        }
    }
}

/// Events emitted by a client during one logical request.
#[derive(Debug, Clone, Copy)]
pub enum LifecycleEvent<'a> {
    /// A request (or a follow-up attempt after a redirect) is being sent
    Request,
    /// A final response head was received
    Response(&'a ResponseHead),
    /// The client is following a redirect or answering an auth challenge
    Redirect(&'a ResponseHead),
    /// The response body was fully buffered
    Complete(&'a CompletedResponse),
    /// The request failed
    Error(&'a TransportError),
}

impl LifecycleEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Request => EventKind::Request,
            LifecycleEvent::Response(_) => EventKind::Response,
            LifecycleEvent::Redirect(_) => EventKind::Redirect,
            LifecycleEvent::Complete(_) => EventKind::Complete,
            LifecycleEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Request,
    Response,
    Redirect,
    Complete,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Request,
        EventKind::Response,
        EventKind::Redirect,
        EventKind::Complete,
        EventKind::Error,
    ];
}

/// Listener invoked with the emitting request's own state.
pub type Listener = Arc<dyn Fn(&RequestState, &LifecycleEvent<'_>) + Send + Sync>;

struct Registration {
    key: Option<SubscriptionKey>,
    kind: EventKind,
    listener: Listener,
}

struct HandleInner {
    state: Mutex<RequestState>,
    listeners: Mutex<Vec<Registration>>,
    outcome: watch::Sender<Option<Outcome>>,
}

/// Releases a deferred request when fired or when the last caller handle is dropped.
struct StartToken(Mutex<Option<oneshot::Sender<()>>>);

impl StartToken {
    fn fire(&self) {
        if let Some(tx) = lock(&self.0).take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for StartToken {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Held by a client that defers its I/O until the caller has had a chance to attach
/// listeners. See [`RequestHandle::deferred`].
#[derive(Debug)]
pub struct StartSignal(oneshot::Receiver<()>);

impl StartSignal {
    /// Resolves once the request may proceed.
    pub async fn ready(self) {
        // A dropped sender also means go: every caller handle is gone.
        let _ = self.0.await;
    }
}

/// Per-request event emitter returned by every dispatch.
///
/// Cloning the handle is cheap; clones refer to the same request.
///
/// Requests created with [`RequestHandle::deferred`] do not start until a caller handle is
/// [started](RequestHandle::start), [awaited](RequestHandle::wait) or dropped, so listeners
/// attached with [`RequestHandle::on`] right after the call see every event.
#[derive(Clone)]
pub struct RequestHandle {
    inner: Arc<HandleInner>,
    start: Option<Arc<StartToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RequestHandle {
    /// A handle for a request the client drives right away.
    pub fn new(state: RequestState) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(HandleInner {
                state: Mutex::new(state),
                listeners: Mutex::new(Vec::new()),
                outcome,
            }),
            start: None,
        }
    }

    /// A handle for a request that waits for the caller. The client awaits the returned
    /// signal before doing any I/O and keeps only [detached](RequestHandle::detached) clones.
    pub fn deferred(state: RequestState) -> (Self, StartSignal) {
        let (tx, rx) = oneshot::channel();
        let mut handle = Self::new(state);
        handle.start = Some(Arc::new(StartToken(Mutex::new(Some(tx)))));
        (handle, StartSignal(rx))
    }

    /// A clone that neither starts the request nor keeps it waiting.
    pub fn detached(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            start: None,
        }
    }

    /// Let a deferred request proceed. No-op for requests that already started.
    pub fn start(&self) {
        if let Some(token) = &self.start {
            token.fire();
        }
    }

    /// Register a listener for one kind of event.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> &Self
    where
        F: Fn(&RequestState, &LifecycleEvent<'_>) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).push(Registration {
            key: None,
            kind,
            listener: Arc::new(listener),
        });
        self
    }

    /// Register a listener owned by `key`. Returns `false` without registering anything when
    /// `key` already owns a listener for `kind`.
    pub fn on_keyed<F>(&self, key: SubscriptionKey, kind: EventKind, listener: F) -> bool
    where
        F: Fn(&RequestState, &LifecycleEvent<'_>) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        if listeners
            .iter()
            .any(|r| r.key == Some(key) && r.kind == kind)
        {
            return false;
        }
        listeners.push(Registration {
            key: Some(key),
            kind,
            listener: Arc::new(listener),
        });
        true
    }

    pub fn is_subscribed(&self, key: SubscriptionKey) -> bool {
        lock(&self.inner.listeners)
            .iter()
            .any(|r| r.key == Some(key))
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Snapshot of the request's current state.
    pub fn state(&self) -> RequestState {
        lock(&self.inner.state).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut RequestState)) {
        f(&mut lock(&self.inner.state));
    }

    /// Deliver `event` to the listeners registered for its kind, in registration order.
    ///
    /// Listeners receive a snapshot of this request's state taken at emission time; they run
    /// without any of the handle's locks held.
    pub fn emit(&self, event: &LifecycleEvent<'_>) {
        let kind = event.kind();
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }

        let state = self.state();
        for listener in listeners {
            listener(&state, event);
        }
    }

    /// Record the final outcome and wake every waiter.
    pub fn finish(&self, outcome: Outcome) {
        self.inner.outcome.send_replace(Some(outcome));
    }

    /// The outcome, if the request has finished.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Start the request if it is deferred and wait for it to finish.
    pub async fn wait(&self) -> Outcome {
        self.start();
        let mut rx = self.inner.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone());
        match outcome {
            Ok(Some(outcome)) => outcome,
            _ => Err(TransportError::Aborted),
        }
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("RequestHandle")
            .field("method", &state.method)
            .field("uri", &state.uri)
            .field("listeners", &self.listener_count())
            .field("finished", &self.inner.outcome.borrow().is_some())
            .finish()
    }
}
