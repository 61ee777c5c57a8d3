//! Correlation id allocation.
//!
//! One id is allocated per logical request, when the call is made, and every record produced by
//! that request carries it. Ids start at 1 and only ever grow.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::DebugId;

/// Process-wide counter used by sessions configured with [`IdScope::Global`]
static GLOBAL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Which counter a session draws its ids from.
///
/// The default is [`IdScope::PerInstance`]: every session, including derived ones, numbers its
/// requests from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdScope {
    #[default]
    PerInstance,
    /// All sessions in the process share one sequence
    Global,
}

#[derive(Debug)]
enum Counter {
    Local(AtomicU64),
    Global,
}

/// Hands out correlation ids for one session.
#[derive(Debug)]
pub struct IdAllocator {
    counter: Counter,
}

impl IdAllocator {
    pub fn new(scope: IdScope) -> Self {
        let counter = match scope {
            IdScope::PerInstance => Counter::Local(AtomicU64::new(1)),
            IdScope::Global => Counter::Global,
        };
        Self { counter }
    }

    fn atomic(&self) -> &AtomicU64 {
        match &self.counter {
            Counter::Local(counter) => counter,
            Counter::Global => &GLOBAL_COUNTER,
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> DebugId {
        self.atomic().fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next allocation will return (for per-instance counters; a global counter may
    /// be advanced concurrently by other sessions).
    pub fn peek(&self) -> DebugId {
        self.atomic().load(Ordering::Relaxed)
    }
}
