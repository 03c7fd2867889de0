// Minis - synaptic event detection core
// Detection, fitting, batch orchestration, and alignment over multi-sweep recordings

pub mod batch;
pub mod config;
pub mod events;
pub mod recording;
pub mod results;
pub mod signal;
pub mod template;

pub use batch::{BatchError, BatchOutcome, BatchProgress, CancellationToken, SweepOrchestrator};
pub use config::{DetectConfig, DetectionMode};
pub use events::{BiexpParams, CandidateEvent, EventRecord, FitResult, ModelBounds, TemplateSource};
pub use recording::{Channel, Epoch, Recording, RecordingShape, Sweep};
pub use results::{ResultRow, ResultTable};
pub use signal::{DcOffset, FilterFamily, PreprocessOptions};
pub use template::{AlignPolicy, AlignedWaveform, Template};
