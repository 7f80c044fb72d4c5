//! Cancellation Signal
//!
//! One cancellation signal exists per workflow tree. Triggering it is
//! idempotent, and long-running operation bodies are expected to observe
//! it on every poll tick so they can exit promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

/// One-shot, workflow-wide abort notification.
///
/// Clones share the underlying flag, so a signal handed to a nested
/// workflow or an operation body observes the same state. Only the first
/// [`cancel`](CancelSignal::cancel) call has an effect; later calls are
/// no-ops.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Creates a signal in the untriggered state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the signal.
    ///
    /// Returns true if this call was the one that triggered it.
    pub fn cancel(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::SeqCst);
        if first {
            info!("cancellation requested");
        }
        first
    }

    /// Returns true once the signal has been triggered.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_starts_untriggered() {
        let signal = CancelSignal::new();
        assert!(!signal.is_canceled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let signal = CancelSignal::new();
        assert!(signal.cancel());
        assert!(signal.is_canceled());
        assert!(!signal.cancel());
        assert!(signal.is_canceled());
    }

    #[test]
    fn test_cancel_shared_between_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        signal.cancel();
        assert!(clone.is_canceled());
    }
}
