//! Mapping from lifecycle events to log records.
//!
//! Everything here is pure: the functions read the emitting request's state and the event, and
//! return an owned record. Which response event produces the response record depends on the
//! [`CaptureMode`] chosen when the call was made.

use axum::http::{header, HeaderMap};
use bytes::Bytes;

use crate::client::{LifecycleEvent, RequestBody, RequestState, ResponseHead};
use crate::types::{
    DebugId, ErrorRecord, Headers, LogRecord, RedirectRecord, RequestRecord, ResponseRecord,
};

/// How the caller consumes the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// A completion was supplied; the client buffers the body and the response is recorded on
    /// `complete`, body included.
    Buffered,
    /// No completion; the caller streams the response, which is recorded on `response` without
    /// a body.
    Streamed,
}

impl CaptureMode {
    pub fn for_completion(has_completion: bool) -> Self {
        if has_completion {
            CaptureMode::Buffered
        } else {
            CaptureMode::Streamed
        }
    }
}

/// Build the record for `event`, if this event produces one in `mode`.
pub fn normalize(
    debug_id: DebugId,
    mode: CaptureMode,
    state: &RequestState,
    event: &LifecycleEvent<'_>,
) -> Option<LogRecord> {
    match (event, mode) {
        (LifecycleEvent::Request, _) => Some(LogRecord::Request(RequestRecord {
            debug_id,
            uri: state.uri.to_string(),
            method: state.method.as_str().to_ascii_uppercase(),
            headers: convert_headers(&state.headers),
            body: request_body(&state.body),
        })),
        (LifecycleEvent::Response(head), CaptureMode::Streamed) => {
            Some(LogRecord::Response(response_record(debug_id, head, None)))
        }
        (LifecycleEvent::Complete(response), CaptureMode::Buffered) => {
            Some(LogRecord::Response(response_record(
                debug_id,
                &response.head(),
                Some(decode_body(&response.headers, &response.body)),
            )))
        }
        (LifecycleEvent::Response(_), CaptureMode::Buffered)
        | (LifecycleEvent::Complete(_), CaptureMode::Streamed) => None,
        (LifecycleEvent::Redirect(head), _) => Some(LogRecord::Redirect(RedirectRecord {
            debug_id,
            headers: convert_headers(&head.headers),
            status_code: head.status.as_u16(),
            uri: state.uri.to_string(),
        })),
        (LifecycleEvent::Error(error), _) => Some(LogRecord::Error(ErrorRecord {
            debug_id,
            error: error.to_string(),
            headers: convert_headers(&state.headers),
            method: state.method.as_str().to_ascii_uppercase(),
            uri: state.uri.to_string(),
        })),
    }
}

fn response_record(
    debug_id: DebugId,
    head: &ResponseHead,
    body: Option<serde_json::Value>,
) -> ResponseRecord {
    ResponseRecord {
        debug_id,
        headers: convert_headers(&head.headers),
        status_code: head.status.as_u16(),
        body,
    }
}

fn request_body(body: &RequestBody) -> Option<String> {
    match body {
        RequestBody::Buffered(bytes) if !bytes.is_empty() => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        _ => None,
    }
}

/// Copy a header map into an owned name/value map.
///
/// Values that are not valid UTF-8 are decoded lossily; repeated headers are joined with `", "`.
pub fn convert_headers(headers: &HeaderMap) -> Headers {
    let mut result = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        result
            .entry(name.as_str().to_owned())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    result
}

/// Decode a buffered response body: JSON content that parses is kept structured, anything else
/// becomes a string.
pub fn decode_body(headers: &HeaderMap, body: &Bytes) -> serde_json::Value {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));

    if is_json {
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
    }
    serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
}
