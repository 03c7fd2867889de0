// Template construction and persistence
// Averages aligned waveforms into a reusable detection template

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::events::fitter;
use crate::events::model::ModelBounds;
use crate::events::types::FitResult;
use crate::template::align::AlignedWaveform;

/// Errors that can occur while building or persisting a template
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("no aligned waveforms to build a template from")]
    Empty,

    #[error("template unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An averaged, fitted event waveform, reusable as a detection seed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Averaged waveform, baseline-corrected and zero-based in time
    pub waveform: Vec<f32>,

    /// Sampling rate of the waveform in Hz
    pub sample_rate_hz: f64,

    /// Number of events averaged into this template
    pub event_count: usize,

    /// Fit of the biexponential model to the averaged waveform, if it converged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit: Option<FitResult>,

    /// Creation timestamp (ISO 8601)
    pub created_at: String,

    /// Format version for future compatibility
    pub version: u32,
}

/// Average aligned waveforms into a template and fit the average
///
/// Waveforms are truncated to the shortest length before averaging. A fit
/// failure on the average is non-fatal; the template ships without
/// annotations.
pub fn build_template(
    aligned: &[AlignedWaveform],
    bounds: &ModelBounds,
    r2_threshold: f64,
) -> Result<Template, TemplateError> {
    if aligned.is_empty() {
        return Err(TemplateError::Empty);
    }

    let min_len = aligned.iter().map(|w| w.samples.len()).min().unwrap_or(0);
    if min_len == 0 {
        return Err(TemplateError::Empty);
    }

    let mut average = vec![0.0f64; min_len];
    for waveform in aligned {
        for (acc, &s) in average.iter_mut().zip(waveform.samples.iter()) {
            *acc += s as f64;
        }
    }
    let count = aligned.len() as f64;
    let waveform: Vec<f32> = average.iter().map(|&a| (a / count) as f32).collect();

    let sample_rate_hz = aligned[0].sample_rate_hz;
    let fit = match fitter::fit(&waveform, bounds, sample_rate_hz, r2_threshold) {
        Ok(result) => Some(result),
        Err(e) => {
            log::warn!("template average did not fit: {}", e);
            None
        }
    };

    Ok(Template {
        waveform,
        sample_rate_hz,
        event_count: aligned.len(),
        fit,
        created_at: chrono::Utc::now().to_rfc3339(),
        version: 1,
    })
}

/// Save a template as JSON
pub fn save_template(template: &Template, path: &Path) -> Result<(), TemplateError> {
    let json = serde_json::to_string_pretty(template)?;
    fs::write(path, json)?;
    log::info!("saved template ({} events) to {}", template.event_count, path.display());
    Ok(())
}

/// Load a template from JSON
/// Any failure is reported as `Unavailable`, so callers can fall back to the
/// synthetic model waveform
pub fn load_template(path: &Path) -> Result<Template, TemplateError> {
    let json = fs::read_to_string(path)
        .map_err(|e| TemplateError::Unavailable(format!("{}: {}", path.display(), e)))?;
    let template: Template = serde_json::from_str(&json)
        .map_err(|e| TemplateError::Unavailable(format!("{}: {}", path.display(), e)))?;
    if template.waveform.is_empty() {
        return Err(TemplateError::Unavailable(format!(
            "{}: template holds no samples",
            path.display()
        )));
    }
    Ok(template)
}
