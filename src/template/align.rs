// Waveform alignment for template construction
// Re-slices accepted events onto a common time origin and corrects baselines

use serde::{Deserialize, Serialize};

use crate::config::DetectConfig;
use crate::events::types::EventRecord;
use crate::recording::Recording;

/// Alignment policy for the common time origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignPolicy {
    /// Align on the fitted onset (x0)
    Onset,

    /// Align on the steepest point of the fitted rising phase
    MaxRise,
}

/// One aligned, baseline-corrected waveform with back-references
/// Time axis is re-originated to zero; all outputs share one duration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignedWaveform {
    pub samples: Vec<f32>,
    pub sample_rate_hz: f64,
    pub sweep_index: usize,
    pub wave_index: usize,
    pub channel_id: String,
}

/// Align accepted event records onto a common origin
///
/// For each record a reference time is derived from the fit (per policy); the
/// extraction window is shifted so every reference lands at the latest
/// reference offset, then the pre-reference baseline mean is subtracted.
/// Records whose shifted window would leave the channel are dropped with a
/// warning. Source records are never mutated.
pub fn align(
    records: &[(usize, &EventRecord)],
    recording: &Recording,
    policy: AlignPolicy,
    config: &DetectConfig,
) -> Vec<AlignedWaveform> {
    if records.is_empty() {
        return Vec::new();
    }

    let references: Vec<f64> = records
        .iter()
        .map(|(_, record)| reference_time_ms(record, policy))
        .collect();
    let max_reference = references.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let mut aligned = Vec::with_capacity(records.len());
    for ((wave_index, record), &reference) in records.iter().zip(references.iter()) {
        let correction = max_reference - reference;
        let candidate = &record.candidate;

        let channel = match recording
            .sweep(candidate.sweep_index)
            .and_then(|s| s.channels.iter().find(|c| c.id == candidate.channel_id))
        {
            Some(c) => c,
            None => {
                log::warn!(
                    "alignment skipped wave {} of sweep {}: channel '{}' not found",
                    wave_index,
                    candidate.sweep_index,
                    candidate.channel_id
                );
                continue;
            }
        };

        let new_start_ms = candidate.window_start_ms - correction;
        let n_out = (config.window_ms() / 1000.0 * channel.sample_rate_hz).round() as usize;
        let start_idx = if new_start_ms < 0.0 {
            usize::MAX // forces the bounds check below to drop the record
        } else {
            channel.index_at_ms(new_start_ms)
        };
        if start_idx == usize::MAX || start_idx + n_out > channel.samples.len() {
            log::warn!(
                "alignment dropped wave {} of sweep {}: shifted window leaves the channel",
                wave_index,
                candidate.sweep_index
            );
            continue;
        }

        let mut samples: Vec<f32> = channel.samples[start_idx..start_idx + n_out].to_vec();

        // Baseline: everything before the common reference offset
        let baseline_len = ((max_reference / 1000.0 * channel.sample_rate_hz) as usize).min(samples.len());
        if baseline_len > 0 {
            let baseline = samples[..baseline_len].iter().map(|&s| s as f64).sum::<f64>()
                / baseline_len as f64;
            for s in samples.iter_mut() {
                *s -= baseline as f32;
            }
        }

        aligned.push(AlignedWaveform {
            samples,
            sample_rate_hz: channel.sample_rate_hz,
            sweep_index: candidate.sweep_index,
            wave_index: *wave_index,
            channel_id: candidate.channel_id.clone(),
        });
    }

    log::debug!("aligned {} of {} record(s) with {:?}", aligned.len(), records.len(), policy);
    aligned
}

/// Reference time within the record's window, per policy (ms)
fn reference_time_ms(record: &EventRecord, policy: AlignPolicy) -> f64 {
    let fit = &record.fit;
    match policy {
        AlignPolicy::Onset => fit.coefficients.onset_ms,
        AlignPolicy::MaxRise => {
            // Steepest slope of the fitted curve; inward events use the
            // steepest negative slope
            let rate = record.candidate.sample_rate_hz;
            let dt_ms = 1000.0 / rate;
            let n = record.candidate.waveform.len();
            if n < 2 {
                return fit.coefficients.onset_ms;
            }
            let curve: Vec<f64> = (0..n)
                .map(|i| fit.coefficients.value_at(i as f64 * dt_ms))
                .collect();
            let inward = fit.amplitude < 0.0;
            let mut best_idx = 0;
            let mut best_slope = if inward { f64::INFINITY } else { f64::NEG_INFINITY };
            for i in 0..n - 1 {
                let slope = curve[i + 1] - curve[i];
                if (inward && slope < best_slope) || (!inward && slope > best_slope) {
                    best_slope = slope;
                    best_idx = i;
                }
            }
            best_idx as f64 * dt_ms
        }
    }
}
