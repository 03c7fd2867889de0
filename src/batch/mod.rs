// Batch orchestration module
// Cancellable multi-sweep detection with per-sweep state and undo

pub mod cancel;
pub mod orchestrator;

pub use cancel::{BatchProgress, CancellationToken};
pub use orchestrator::{
    BatchError, BatchHandle, BatchOutcome, SweepDetectionState, SweepFailure, SweepOrchestrator,
};
