// Event detection types
// Candidate events, fit results, and the combined event record

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::events::model::{BiexpParams, Diagnostic};

/// A detector-proposed event, prior to fitting
/// Immutable once created; the fitter only reads it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    /// Index of the owning sweep within the recording
    pub sweep_index: usize,

    /// Id of the channel the event was detected on
    pub channel_id: String,

    /// Detected onset time, relative to the parent sweep's channel (ms)
    pub start_ms: f64,

    /// Time of the waveform extremum within the event window (ms)
    pub peak_ms: f64,

    /// Raw waveform slice around the event:
    /// `[start - baseline margin, start + event duration)`
    pub waveform: Vec<f32>,

    /// Time of the first waveform sample, relative to the channel (ms)
    pub window_start_ms: f64,

    /// Number of pre-onset baseline samples at the head of `waveform`
    pub baseline_samples: usize,

    /// Sampling rate of the waveform slice in Hz
    pub sample_rate_hz: f64,
}

impl CandidateEvent {
    /// Mean of the pre-onset baseline segment
    pub fn baseline_mean(&self) -> f64 {
        let n = self.baseline_samples.min(self.waveform.len());
        if n == 0 {
            return self.waveform.first().copied().unwrap_or(0.0) as f64;
        }
        self.waveform[..n].iter().map(|&s| s as f64).sum::<f64>() / n as f64
    }

    /// Signed peak deviation of the raw waveform from the baseline mean
    pub fn raw_amplitude(&self) -> f64 {
        let baseline = self.baseline_mean();
        self.waveform
            .iter()
            .map(|&s| s as f64 - baseline)
            .max_by(|a, b| a.abs().partial_cmp(&b.abs()).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or(0.0)
    }
}

/// Outcome of fitting one candidate against the biexponential model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Fitted model parameters; immutable unless an explicit re-fit runs
    pub coefficients: BiexpParams,

    /// Coefficient of determination between fit and waveform, in [0, 1]
    pub r2: f64,

    /// Peak deviation of the fitted curve from its fitted offset (signed)
    pub amplitude: f64,

    /// Acceptance flag; re-derived by threshold application, toggleable
    pub accepted: bool,

    /// Non-fatal conditions raised during bound repair
    pub diagnostics: Vec<Diagnostic>,
}

/// Where the detection template came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateSource {
    /// Synthetic waveform generated from the model's initial parameters
    Synthetic,

    /// A stored template loaded from the given path
    Stored(PathBuf),
}

impl TemplateSource {
    pub fn is_stored(&self) -> bool {
        matches!(self, TemplateSource::Stored(_))
    }
}

/// The atomic unit exposed to callers: candidate + fit + flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier for this record
    pub id: Uuid,

    pub candidate: CandidateEvent,

    pub fit: FitResult,

    /// Set once the record has contributed to an alignment pass
    pub aligned: bool,

    /// Which template the detection that produced this record used
    pub template: TemplateSource,
}

impl EventRecord {
    pub fn new(candidate: CandidateEvent, fit: FitResult, template: TemplateSource) -> Self {
        EventRecord {
            id: Uuid::new_v4(),
            candidate,
            fit,
            aligned: false,
            template,
        }
    }
}
