//! On/off switch for record capture.

use std::sync::atomic::{AtomicBool, Ordering};

/// Gates whether a session allocates ids and produces records.
///
/// Suspending never affects the requests themselves, only whether they are observed. Both
/// transitions are idempotent.
#[derive(Debug)]
pub struct CaptureController {
    active: AtomicBool,
}

impl CaptureController {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
        }
    }

    pub fn suspend(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_idempotent() {
        let capture = CaptureController::default();
        assert!(capture.is_active());

        capture.resume();
        assert!(capture.is_active());

        capture.suspend();
        capture.suspend();
        assert!(!capture.is_active());

        capture.resume();
        assert!(capture.is_active());
        assert!(!CaptureController::new(false).is_active());
    }
}
