// Detection configuration
// Flat key -> effect surface; all fields independently settable before a run

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::events::model::ModelBounds;
use crate::signal::PreprocessOptions;

/// Detection criterion mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMode {
    /// Sliding template-scaling statistic; threshold is unbounded, >= 0
    Sliding,

    /// Normalized cross-correlation; threshold is a percentage of the
    /// maximum observed correlation, clamped to [0, 100]
    CrossCorrelation,
}

/// Configuration for a detection run
///
/// The threshold ranges of the two detection modes are intentionally
/// independent: `Sliding` interprets `detection_threshold` as an unbounded
/// criterion value, `CrossCorrelation` as a percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    pub detection_mode: DetectionMode,

    /// Detection threshold; interpretation depends on `detection_mode`
    pub detection_threshold: f64,

    /// Expected event duration in milliseconds; also the minimum separation
    /// between two detected events
    pub event_duration_ms: f64,

    /// Pre-onset baseline margin included in each extracted waveform (ms)
    pub baseline_margin_ms: f64,

    /// Model parameter bounds: lower / initial / upper per parameter
    pub model: ModelBounds,

    /// Signal preprocessing applied before detection
    pub preprocess: PreprocessOptions,

    /// Seed detection with a stored template instead of the synthetic model
    pub use_template: bool,

    /// Where to load the stored template from
    pub template_path: Option<PathBuf>,

    /// Acceptance threshold on the fit's coefficient of determination
    pub r2_threshold: f64,

    /// Align on the steepest point of the rising phase instead of the onset
    pub align_on_rising_phase: bool,

    /// Remove a sweep's previous detection before installing a new one
    pub clear_previous_on_detect: bool,

    /// Include rejected waves in the aggregated result table
    pub include_all_waves_in_result: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        DetectConfig {
            detection_mode: DetectionMode::Sliding,
            detection_threshold: 4.0,
            event_duration_ms: 30.0,
            baseline_margin_ms: 5.0,
            model: ModelBounds::default(),
            preprocess: PreprocessOptions::default(),
            use_template: false,
            template_path: None,
            r2_threshold: 0.5,
            align_on_rising_phase: false,
            clear_previous_on_detect: true,
            include_all_waves_in_result: false,
        }
    }
}

impl DetectConfig {
    /// Full extraction window length in milliseconds
    pub fn window_ms(&self) -> f64 {
        self.baseline_margin_ms + self.event_duration_ms
    }
}
