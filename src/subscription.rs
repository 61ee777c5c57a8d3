//! Attaching lifecycle listeners to outgoing requests.
//!
//! A session observes a call by appending one keyed hook to the call's [`InitChain`]. When the
//! client creates the request handle and runs the chain, the hook registers one listener per
//! [`EventKind`]. The key identifies the session lineage, so the same session can never observe
//! a request twice: a second install on the same chain, or a second attach on the same handle,
//! is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::client::{EventKind, InitChain, RequestHandle};
use crate::normalize::{normalize, CaptureMode};
use crate::types::{DebugId, LogRecord};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of an observer, used to keep its hooks and listeners unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(u64);

impl SubscriptionKey {
    pub fn fresh() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where normalized records go.
pub(crate) trait RecordTarget: Send + Sync + 'static {
    /// Whether records are currently wanted. Checked for every event before normalizing.
    fn accepts(&self) -> bool;

    fn forward(&self, record: LogRecord);
}

/// Add the hook that observes one call. Returns `false` if `key` already observes this call.
pub(crate) fn install<T: RecordTarget>(
    chain: &mut InitChain,
    key: SubscriptionKey,
    debug_id: DebugId,
    mode: CaptureMode,
    target: Arc<T>,
) -> bool {
    chain.push_keyed(
        key,
        Arc::new(move |handle: &RequestHandle| {
            attach(handle, key, debug_id, mode, target.clone());
        }),
    )
}

/// Register the lifecycle listeners on `handle`. Returns `false` if `key` is already subscribed.
pub(crate) fn attach<T: RecordTarget>(
    handle: &RequestHandle,
    key: SubscriptionKey,
    debug_id: DebugId,
    mode: CaptureMode,
    target: Arc<T>,
) -> bool {
    if handle.is_subscribed(key) {
        trace!(debug_id = %debug_id, "Request already observed; skipping listener attachment");
        return false;
    }

    for kind in EventKind::ALL {
        let target = target.clone();
        handle.on_keyed(key, kind, move |state, event| {
            if !target.accepts() {
                return;
            }
            if let Some(record) = normalize(debug_id, mode, state, event) {
                target.forward(record);
            }
        });
    }
    true
}
