//! # request-debug
//!
//! Observe the lifecycle of outbound HTTP requests (request sent, response received, redirect
//! followed, auth challenge answered, request failed) and relay a structured record of each
//! event to a pluggable sink, without touching call sites.
//!
//! ## Features
//!
//! - **Decoration, not patching**: a [`DebugSession`] wraps any [`HttpClient`] and exposes the
//!   same calls; [`DebugSession::into_inner`] gives the raw client back
//! - **Correlation ids**: every record produced by one logical request, redirects included,
//!   carries the same `debugId`
//! - **Toggleable**: [`DebugSession::suspend`] / [`DebugSession::resume`] stop and restart
//!   observation without affecting the requests
//! - **Derivable**: [`DebugSession::derive`] binds extra default options and keeps the parent's
//!   capture state and sink
//! - **Extensible**: implement [`LogSink`] (or pass a closure) to process records
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{routing::get, Json, Router};
//! use request_debug::{DebugSession, Options, ServiceClient};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let app = Router::new().route("/hello", get(|| async { Json(serde_json::json!({ "key": "value" })) }));
//! let session = DebugSession::new(Arc::new(ServiceClient::new(app)))?;
//!
//! // Records are written to stderr as they happen:
//! // {"request":{"debugId":1,"uri":"http://localhost/hello","method":"GET","headers":{}}}
//! // {"response":{"debugId":1,"headers":{...},"statusCode":200,"body":{"key":"value"}}}
//! let handle = session.get(
//!     "http://localhost/hello",
//!     Options::new(),
//!     Some(Box::new(|outcome: request_debug::Outcome| println!("{:?}", outcome.map(|r| r.status)))),
//! );
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Sinks
//!
//! ```rust
//! use request_debug::{LogSink, types::{LogRecord, RecordKind}};
//!
//! struct CountingSink(std::sync::atomic::AtomicUsize);
//!
//! impl LogSink for CountingSink {
//!     fn log(&self, kind: RecordKind, record: &LogRecord) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!         println!("{kind} #{}", record.debug_id());
//!     }
//! }
//! ```

use axum::http::Method;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace, warn};

pub mod capture;
pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod logging_handler;
pub mod multi_handler;
pub mod normalize;
pub mod service_client;
pub mod subscription;
pub mod types;

pub use capture::CaptureController;
pub use client::{
    merge_options, Capabilities, CompletedResponse, Completion, Dispatch, EventKind, HttpClient,
    InitChain, LifecycleEvent, Options, Outcome, RequestBody, RequestHandle, RequestState,
    ResponseHead, SharedClient, StartSignal, Target,
};
pub use config::DebugConfig;
pub use correlation::{IdAllocator, IdScope};
pub use error::{DebugError, TransportError};
pub use logging_handler::{StderrSink, TracingSink};
pub use multi_handler::MultiSink;
pub use normalize::CaptureMode;
pub use service_client::ServiceClient;
pub use subscription::SubscriptionKey;

use subscription::RecordTarget;
use types::{DebugId, LogRecord, RecordKind};

/// Receiver of captured records.
///
/// Called synchronously, in event order, from whatever context the client emits events in.
/// Implemented for any `Fn(RecordKind, &LogRecord)` closure.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, kind: RecordKind, record: &LogRecord);
}

impl<F> LogSink for F
where
    F: Fn(RecordKind, &LogRecord) + Send + Sync + 'static,
{
    fn log(&self, kind: RecordKind, record: &LogRecord) {
        self(kind, record)
    }
}

pub type SharedSink = Arc<dyn LogSink>;

/// State shared by every clone of one session and by the listeners it attached.
struct SessionState {
    key: SubscriptionKey,
    capture: CaptureController,
    ids: IdAllocator,
    sink: RwLock<SharedSink>,
}

impl SessionState {
    fn sink(&self) -> SharedSink {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RecordTarget for SessionState {
    fn accepts(&self) -> bool {
        self.capture.is_active()
    }

    fn forward(&self, record: LogRecord) {
        let kind = record.kind();
        trace!(debug_id = %record.debug_id(), kind = %kind, "Forwarding record");
        self.sink().log(kind, &record);
    }
}

/// An observed HTTP client.
///
/// Wraps a client, binding the session's default options into it, and exposes the verb calls
/// of the client. Calls made while the session is capturing get a correlation id and have their
/// lifecycle events recorded; calls made while it is suspended go straight to the client.
///
/// Cloning a session is cheap and clones share capture state, sink and id sequence.
#[derive(Clone)]
pub struct DebugSession {
    client: SharedClient,
    options: Arc<Options>,
    config: DebugConfig,
    derivable: bool,
    state: Arc<SessionState>,
}

impl DebugSession {
    /// Wrap `client` with no default options and the default configuration.
    pub fn new(client: SharedClient) -> Result<Self, DebugError> {
        Self::with_config(client, Options::new(), DebugConfig::default())
    }

    /// Wrap `client`, binding `options` as its defaults.
    pub fn with_options(client: SharedClient, options: Options) -> Result<Self, DebugError> {
        Self::with_config(client, options, DebugConfig::default())
    }

    /// Wrap `client` with explicit options and configuration.
    ///
    /// Wrapping a client that already is a session returns that session unchanged, or a session
    /// derived from it when `options` is not empty. The existing session's configuration is kept.
    ///
    /// # Errors
    ///
    /// - [`DebugError::InvalidClient`] if the client cannot bind defaults or dispatch calls
    /// - [`DebugError::InvalidLogger`] if `config.logger` does not name a built-in sink
    pub fn with_config(
        client: SharedClient,
        options: Options,
        config: DebugConfig,
    ) -> Result<Self, DebugError> {
        if let Some(existing) = client.debug_session() {
            if config != *existing.config() {
                warn!("Client is already observed; keeping its configuration");
            }
            if options.is_empty() {
                debug!("Client is already observed; reusing its session");
                return Ok(existing);
            }
            debug!("Client is already observed; deriving a session with the new options");
            return existing.derive(options);
        }

        let capabilities = client.capabilities();
        if !capabilities.bind_defaults {
            return Err(DebugError::InvalidClient("cannot bind default options"));
        }
        if !capabilities.can_dispatch() {
            return Err(DebugError::InvalidClient("cannot dispatch requests"));
        }

        let sink = config.sink()?;
        let capturing = config.capture;
        Self::bind(client, options, config, sink, capturing)
    }

    fn bind(
        client: SharedClient,
        options: Options,
        config: DebugConfig,
        sink: SharedSink,
        capturing: bool,
    ) -> Result<Self, DebugError> {
        let bound = client
            .defaults(&options)
            .ok_or(DebugError::InvalidClient("default option binding failed"))?;
        let derivable = bound.capabilities().bind_defaults;

        let state = Arc::new(SessionState {
            key: SubscriptionKey::fresh(),
            capture: CaptureController::new(capturing),
            ids: IdAllocator::new(config.id_scope),
            sink: RwLock::new(sink),
        });
        debug!(
            capturing,
            derivable,
            id_scope = ?config.id_scope,
            "Debug session created"
        );

        Ok(Self {
            client: bound,
            options: Arc::new(options),
            config,
            derivable,
            state,
        })
    }

    pub fn delete(
        &self,
        target: impl Into<Target>,
        options: Options,
        completion: Option<Completion>,
    ) -> RequestHandle {
        self.call(Some(Method::DELETE), target, options, completion)
    }

    pub fn get(
        &self,
        target: impl Into<Target>,
        options: Options,
        completion: Option<Completion>,
    ) -> RequestHandle {
        self.call(Some(Method::GET), target, options, completion)
    }

    pub fn head(
        &self,
        target: impl Into<Target>,
        options: Options,
        completion: Option<Completion>,
    ) -> RequestHandle {
        self.call(Some(Method::HEAD), target, options, completion)
    }

    pub fn patch(
        &self,
        target: impl Into<Target>,
        options: Options,
        completion: Option<Completion>,
    ) -> RequestHandle {
        self.call(Some(Method::PATCH), target, options, completion)
    }

    pub fn post(
        &self,
        target: impl Into<Target>,
        options: Options,
        completion: Option<Completion>,
    ) -> RequestHandle {
        self.call(Some(Method::POST), target, options, completion)
    }

    pub fn put(
        &self,
        target: impl Into<Target>,
        options: Options,
        completion: Option<Completion>,
    ) -> RequestHandle {
        self.call(Some(Method::PUT), target, options, completion)
    }

    /// Call without a method; the client takes it from the options (`GET` when absent).
    pub fn request(
        &self,
        target: impl Into<Target>,
        completion: Option<Completion>,
    ) -> RequestHandle {
        self.call(None, target, Options::new(), completion)
    }

    /// Dispatch a call through the wrapped client. The returned handle is the client's own.
    pub fn call(
        &self,
        method: Option<Method>,
        target: impl Into<Target>,
        options: Options,
        completion: Option<Completion>,
    ) -> RequestHandle {
        let mut dispatch = Dispatch::new(method, target).with_options(options);
        dispatch.completion = completion;
        self.dispatch_observed(dispatch)
    }

    fn dispatch_observed(&self, mut dispatch: Dispatch) -> RequestHandle {
        self.observe(&mut dispatch);
        self.client.dispatch(dispatch)
    }

    /// Attach this session's observation hook to `dispatch`, allocating its correlation id.
    fn observe(&self, dispatch: &mut Dispatch) {
        if dispatch.init.contains(self.state.key) {
            trace!("Call already observed by this session");
            return;
        }
        if !self.state.capture.is_active() {
            trace!("Capture suspended; dispatching unobserved");
            return;
        }

        let debug_id = self.state.ids.next_id();
        let mode = CaptureMode::for_completion(dispatch.completion.is_some());
        debug!(debug_id = %debug_id, mode = ?mode, "Observing request");
        subscription::install(
            &mut dispatch.init,
            self.state.key,
            debug_id,
            mode,
            self.state.clone(),
        );
    }

    /// Stop capturing. Requests keep working; no ids are allocated and no records produced.
    pub fn suspend(&self) {
        debug!("Capture suspended");
        self.state.capture.suspend();
    }

    /// Start capturing again.
    pub fn resume(&self) {
        debug!("Capture resumed");
        self.state.capture.resume();
    }

    pub fn is_capturing(&self) -> bool {
        self.state.capture.is_active()
    }

    /// Replace the sink. Events already in flight are delivered to the new sink.
    pub fn set_logger<S: LogSink>(&self, sink: S) {
        self.set_shared_logger(Arc::new(sink));
    }

    pub fn set_shared_logger(&self, sink: SharedSink) {
        *self
            .state
            .sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Replace the sink with a built-in one.
    ///
    /// # Errors
    ///
    /// [`DebugError::InvalidLogger`] if `name` is not a built-in sink; the current sink is kept.
    pub fn set_logger_named(&self, name: &str) -> Result<(), DebugError> {
        let sink = logging_handler::named(name)?;
        self.set_shared_logger(sink);
        Ok(())
    }

    pub fn logger(&self) -> SharedSink {
        self.state.sink()
    }

    /// Create a session over a client with `options` merged over this session's defaults.
    ///
    /// The new session starts with this session's current capture state and sink, and its own
    /// id sequence (unless ids are global).
    ///
    /// # Errors
    ///
    /// [`DebugError::UnsupportedOperation`] if the wrapped client cannot produce derivatives.
    pub fn derive(&self, options: Options) -> Result<DebugSession, DebugError> {
        if !self.derivable {
            return Err(DebugError::UnsupportedOperation);
        }

        let merged = merge_options(&self.options, &options);
        Self::bind(
            self.client.clone(),
            merged,
            self.config.clone(),
            self.logger(),
            self.is_capturing(),
        )
    }

    /// Options bound when this session was created.
    pub fn base_options(&self) -> &Options {
        &self.options
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    /// The id the next observed request will get.
    pub fn peek_next_id(&self) -> DebugId {
        self.state.ids.peek()
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    /// Give back the wrapped client. Calls made through it are not observed.
    pub fn into_inner(self) -> SharedClient {
        self.client
    }
}

impl HttpClient for DebugSession {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            bind_defaults: self.derivable,
            ..self.client.capabilities()
        }
    }

    fn defaults(&self, options: &Options) -> Option<SharedClient> {
        self.derive(options.clone())
            .ok()
            .map(|session| Arc::new(session) as SharedClient)
    }

    fn dispatch(&self, dispatch: Dispatch) -> RequestHandle {
        self.dispatch_observed(dispatch)
    }

    fn debug_session(&self) -> Option<DebugSession> {
        Some(self.clone())
    }
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("capturing", &self.is_capturing())
            .field("next_id", &self.peek_next_id())
            .field("options", &self.options)
            .field("config", &self.config)
            .field("derivable", &self.derivable)
            .finish()
    }
}
