//! Built-in sinks.
//!
//! [`StderrSink`] is the default: it writes each record as a single JSON object keyed by the
//! record kind, one per line. [`TracingSink`] relays records as structured `tracing` events,
//! which is usually what you want inside an application that already has a subscriber.

use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::DebugError;
use crate::types::{LogRecord, RecordKind};
use crate::{LogSink, SharedSink};

/// Writes `{"<kind>": <record>}` lines to standard error.
///
/// # Examples
///
/// ```rust
/// use request_debug::{types::*, StderrSink};
///
/// let record = LogRecord::Request(RequestRecord {
///     debug_id: 1,
///     uri: "http://localhost/hello".into(),
///     method: "GET".into(),
///     headers: Default::default(),
///     body: None,
/// });
/// let line = StderrSink::render(RecordKind::Request, &record).unwrap();
/// assert!(line.starts_with(r#"{"request":{"debugId":1"#));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrSink;

impl StderrSink {
    /// The line written for one record.
    pub fn render(kind: RecordKind, record: &LogRecord) -> Result<String, serde_json::Error> {
        let mut entry = serde_json::Map::new();
        entry.insert(kind.to_string(), serde_json::to_value(record)?);
        serde_json::to_string(&entry)
    }
}

impl LogSink for StderrSink {
    fn log(&self, kind: RecordKind, record: &LogRecord) {
        match Self::render(kind, record) {
            Ok(line) => {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
            Err(e) => {
                warn!(debug_id = %record.debug_id(), error = %e, "Failed to serialize record");
            }
        }
    }
}

/// Relays records as `tracing` events at `INFO` level.
///
/// The logged fields are:
/// - `debug_id` and `kind` for every record
/// - method and URI for requests and errors
/// - status code for responses and redirects
/// - headers (in debug format)
/// - body size for requests and buffered responses
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, kind: RecordKind, record: &LogRecord) {
        match record {
            LogRecord::Request(r) => info!(
                debug_id = %r.debug_id,
                kind = %kind,
                method = %r.method,
                uri = %r.uri,
                headers = ?r.headers,
                body_size = r.body.as_ref().map(|b| b.len()).unwrap_or(0),
                "Request captured"
            ),
            LogRecord::Response(r) => info!(
                debug_id = %r.debug_id,
                kind = %kind,
                status = r.status_code,
                headers = ?r.headers,
                body_size = r.body.as_ref().map(|b| b.to_string().len()).unwrap_or(0),
                "Response captured"
            ),
            LogRecord::Redirect(r) => info!(
                debug_id = %r.debug_id,
                kind = %kind,
                status = r.status_code,
                uri = %r.uri,
                headers = ?r.headers,
                "Redirect captured"
            ),
            LogRecord::Error(r) => info!(
                debug_id = %r.debug_id,
                kind = %kind,
                method = %r.method,
                uri = %r.uri,
                error = %r.error,
                "Request failed"
            ),
        }
    }
}

/// Look up a built-in sink by name: `"stderr"` or `"tracing"`.
pub fn named(name: &str) -> Result<SharedSink, DebugError> {
    match name {
        "stderr" => Ok(Arc::new(StderrSink)),
        "tracing" => Ok(Arc::new(TracingSink)),
        other => Err(DebugError::InvalidLogger(other.to_owned())),
    }
}
