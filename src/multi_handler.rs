//! Composite sink for fanning records out to several sinks.
//!
//! # Example
//!
//! ```rust
//! use request_debug::{MultiSink, StderrSink, TracingSink};
//!
//! let sink = MultiSink::new().with(TracingSink).with(StderrSink);
//! assert_eq!(sink.len(), 2);
//! ```

use std::sync::Arc;

use crate::types::{LogRecord, RecordKind};
use crate::{LogSink, SharedSink};

/// A sink that delegates to multiple inner sinks.
///
/// Each record is handed to every inner sink, in the order they were added.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<SharedSink>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to the chain. Returns self for builder pattern.
    pub fn with<S: LogSink>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Add an already shared sink, e.g. one obtained from a session.
    pub fn with_shared(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

impl LogSink for MultiSink {
    fn log(&self, kind: RecordKind, record: &LogRecord) {
        for sink in &self.sinks {
            sink.log(kind, record);
        }
    }
}
