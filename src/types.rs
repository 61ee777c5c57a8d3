//! Data types for captured lifecycle records.
//!
//! This module contains the structured records handed to a [`LogSink`](crate::LogSink), one per
//! observed lifecycle event. Records own all of their data: header maps are copied out of the
//! client's state when the record is built, so later mutations of the in-flight request are
//! never visible through a record.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Correlation id shared by every record produced by one logical request.
pub type DebugId = u64;

/// Header snapshot as name/value pairs. Repeated headers are joined with `", "`.
pub type Headers = BTreeMap<String, String>;

/// The kind a record is reported under.
///
/// Redirect records are reported as [`RecordKind::Auth`] when the status that triggered them
/// was `401 Unauthorized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Request,
    Response,
    Redirect,
    Auth,
    Error,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Request => "request",
            RecordKind::Response => "response",
            RecordKind::Redirect => "redirect",
            RecordKind::Auth => "auth",
            RecordKind::Error => "error",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data captured when a request is sent.
///
/// # Examples
///
/// ```rust
/// use request_debug::types::RequestRecord;
///
/// let record = RequestRecord {
///     debug_id: 1,
///     uri: "http://localhost/hello".into(),
///     method: "GET".into(),
///     headers: Default::default(),
///     body: None,
/// };
/// let json = serde_json::to_value(&record).unwrap();
/// assert_eq!(json["debugId"], 1);
/// assert!(json.get("body").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub debug_id: DebugId,
    /// Absolute URI of this attempt
    pub uri: String,
    /// Upper-cased method
    pub method: String,
    pub headers: Headers,
    /// Request body, present only when it was buffered when the request was sent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Data captured when a final response is received.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub debug_id: DebugId,
    pub headers: Headers,
    pub status_code: u16,
    /// Buffered response body; absent for streamed responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// Data captured when the client follows a redirect or answers an auth challenge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectRecord {
    pub debug_id: DebugId,
    /// Headers of the response that triggered the redirect
    pub headers: Headers,
    pub status_code: u16,
    /// The URI the client is about to request next
    pub uri: String,
}

/// Data captured when the request fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub debug_id: DebugId,
    pub error: String,
    pub headers: Headers,
    pub method: String,
    pub uri: String,
}

/// A normalized lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogRecord {
    Request(RequestRecord),
    Response(ResponseRecord),
    Redirect(RedirectRecord),
    Error(ErrorRecord),
}

impl LogRecord {
    /// The kind this record is reported under.
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Request(_) => RecordKind::Request,
            LogRecord::Response(_) => RecordKind::Response,
            LogRecord::Redirect(r) if r.status_code == 401 => RecordKind::Auth,
            LogRecord::Redirect(_) => RecordKind::Redirect,
            LogRecord::Error(_) => RecordKind::Error,
        }
    }

    pub fn debug_id(&self) -> DebugId {
        match self {
            LogRecord::Request(r) => r.debug_id,
            LogRecord::Response(r) => r.debug_id,
            LogRecord::Redirect(r) => r.debug_id,
            LogRecord::Error(r) => r.debug_id,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            LogRecord::Request(r) => &r.headers,
            LogRecord::Response(r) => &r.headers,
            LogRecord::Redirect(r) => &r.headers,
            LogRecord::Error(r) => &r.headers,
        }
    }
}
