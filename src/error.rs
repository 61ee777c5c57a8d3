//! Error types.
//!
//! [`DebugError`] covers misuse of the session's control surface and is always returned
//! synchronously from the call that caused it. [`TransportError`] is produced by the HTTP client
//! itself; the session only observes it and never alters it.

use thiserror::Error;

/// Errors returned by [`DebugSession`](crate::DebugSession) construction and control methods.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DebugError {
    /// The wrapped client cannot bind default options or dispatch requests
    #[error("Invalid HTTP client: {0}")]
    InvalidClient(&'static str),

    /// The requested logger does not name a known sink
    #[error("Logger must be a known sink, got `{0}`")]
    InvalidLogger(String),

    /// The bound client cannot produce derived clients
    #[error("Client does not support recursive method `defaults`")]
    UnsupportedOperation,
}

/// Failures of an outbound request, as reported by the HTTP client.
///
/// Cloneable so the same failure can be handed to the error listeners, the completion and every
/// waiter on the request handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The request target could not be turned into a URI
    #[error("Invalid URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The request could not be assembled
    #[error("Failed to build request: {0}")]
    RequestBuild(String),

    /// The underlying service failed
    #[error("Transport error: {0}")]
    Service(String),

    /// The response body stream failed
    #[error("Body stream error: {0}")]
    Body(String),

    /// A single attempt exceeded the configured timeout
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// The redirect chain exceeded the configured limit
    #[error("Exceeded maxRedirects. Probably stuck in a redirect loop after {0} redirects")]
    TooManyRedirects(usize),

    /// The request was dropped before it produced an outcome
    #[error("Request aborted")]
    Aborted,

    /// The call was made outside an async runtime
    #[error("No async runtime to drive the request: {0}")]
    NoRuntime(String),
}
