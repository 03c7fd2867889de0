// Cooperative cancellation and progress reporting
// The token is an explicit object passed into batch calls, never ambient state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Thread-safe cancellation token: an atomic flag plus an optional reason
///
/// Cloning shares the underlying flag, so a clone handed to a worker observes
/// cancellations requested from the control thread. Cancellation is
/// cooperative: the batch polls the flag between sweeps and stops cleanly.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Request cancellation with a human-readable reason
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        *self.reason.lock().unwrap() = Some(reason.into());
        self.cancel();
    }

    /// True once cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The reason given at cancellation time, if any
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }
}

/// One progress notification per completed sweep
/// Informational only; correctness never depends on it
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    /// Index of the sweep that just finished processing
    pub sweep_index: usize,

    /// Total number of sweeps in the batch
    pub total_sweeps: usize,

    /// Events detected and fitted on this sweep
    pub events_found: usize,
}
