// Event detection over a channel slice
// Sliding template-scaling criterion and FFT-backed normalized cross-correlation

use realfft::num_complex::Complex;
use realfft::RealFftPlanner;

use crate::config::{DetectConfig, DetectionMode};
use crate::events::model;
use crate::events::types::CandidateEvent;
use crate::recording::{Channel, Epoch};

/// Build the synthetic detection template from the model's initial parameters
/// The onset sits at the baseline margin so the template spans one extraction window
pub fn synthetic_template(config: &DetectConfig, sample_rate_hz: f64) -> Vec<f32> {
    let mut params = config.model.initial;
    params.offset = 0.0;
    params.onset_ms = config.baseline_margin_ms;
    model::evaluate(&params, config.window_ms(), sample_rate_hz)
}

/// Detect candidate events on a channel, ordered by start time
///
/// With designated epochs, detection runs independently per epoch sub-slice
/// and the results are concatenated in epoch order, with start times
/// expressed relative to the parent channel. A fresh call always re-scans
/// from the start.
pub fn detect(
    channel: &Channel,
    epochs: &[Epoch],
    template: &[f32],
    config: &DetectConfig,
    sweep_index: usize,
) -> Vec<CandidateEvent> {
    if epochs.is_empty() {
        return scan_slice(channel, 0.0, template, config, sweep_index);
    }

    let mut candidates = Vec::new();
    for epoch in epochs {
        let sub = channel.slice(epoch.start_ms, epoch.end_ms);
        // Snap the offset to the sample grid so times stay channel-relative
        let offset_ms = channel.ms_at_index(channel.index_at_ms(epoch.start_ms));
        candidates.extend(scan_slice(&sub, offset_ms, template, config, sweep_index));
    }
    candidates
}

/// Scan one contiguous slice for candidates
fn scan_slice(
    channel: &Channel,
    time_offset_ms: f64,
    template: &[f32],
    config: &DetectConfig,
    sweep_index: usize,
) -> Vec<CandidateEvent> {
    let n = channel.samples.len();
    let m = template.len();
    if m == 0 || n < m {
        return Vec::new();
    }

    let samples: Vec<f64> = channel.samples.iter().map(|&s| s as f64).collect();
    let tmpl: Vec<f64> = template.iter().map(|&s| s as f64).collect();

    let raw_corr = raw_cross_correlation(&samples, &tmpl);
    let criterion = match config.detection_mode {
        DetectionMode::Sliding => sliding_criterion(&samples, &tmpl, &raw_corr),
        DetectionMode::CrossCorrelation => normalized_correlation(&samples, &tmpl, &raw_corr),
    };

    let picks = match config.detection_mode {
        DetectionMode::Sliding => {
            // Every sample above the (unbounded, non-negative) threshold
            let threshold = config.detection_threshold.max(0.0);
            (0..criterion.len()).filter(|&k| criterion[k] > threshold).collect::<Vec<_>>()
        }
        DetectionMode::CrossCorrelation => {
            // Local maxima above a percentage of the maximum observed correlation
            let percent = config.detection_threshold.clamp(0.0, 100.0);
            let max_corr = criterion.iter().cloned().fold(f64::MIN, f64::max);
            if max_corr <= 0.0 {
                Vec::new()
            } else {
                let floor = max_corr * percent / 100.0;
                (0..criterion.len())
                    .filter(|&k| {
                        let left = k == 0 || criterion[k] > criterion[k - 1];
                        let right = k + 1 == criterion.len() || criterion[k] >= criterion[k + 1];
                        left && right && criterion[k] >= floor
                    })
                    .collect::<Vec<_>>()
            }
        }
    };

    let dt_ms = 1000.0 / channel.sample_rate_hz;
    let baseline_samples = (config.baseline_margin_ms / dt_ms).round() as usize;

    // Minimum-separation rule: merge picks closer than the event duration,
    // keeping the earlier one
    let mut candidates: Vec<CandidateEvent> = Vec::new();
    let mut last_start_ms = f64::NEG_INFINITY;
    for k in picks {
        let start_ms = time_offset_ms + (k + baseline_samples) as f64 * dt_ms;
        if start_ms - last_start_ms < config.event_duration_ms {
            continue;
        }
        last_start_ms = start_ms;

        let waveform: Vec<f32> = channel.samples[k..k + m].to_vec();
        let window_start_ms = time_offset_ms + k as f64 * dt_ms;

        // Peak: largest deviation from the pre-onset baseline, after onset
        let baseline = if baseline_samples > 0 {
            waveform[..baseline_samples.min(waveform.len())]
                .iter()
                .map(|&s| s as f64)
                .sum::<f64>()
                / baseline_samples.min(waveform.len()) as f64
        } else {
            waveform[0] as f64
        };
        let peak_rel = waveform
            .iter()
            .enumerate()
            .skip(baseline_samples.min(waveform.len().saturating_sub(1)))
            .max_by(|a, b| {
                let da = (*a.1 as f64 - baseline).abs();
                let db = (*b.1 as f64 - baseline).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let peak_ms = window_start_ms + peak_rel as f64 * dt_ms;

        candidates.push(CandidateEvent {
            sweep_index,
            channel_id: channel.id.clone(),
            start_ms,
            peak_ms,
            waveform,
            window_start_ms,
            baseline_samples,
            sample_rate_hz: channel.sample_rate_hz,
        });
    }

    log::debug!(
        "detected {} candidate(s) on '{}' (offset {:.1} ms)",
        candidates.len(),
        channel.id,
        time_offset_ms
    );
    candidates
}

/// Raw sliding dot product of the template against every window position
/// Computed as an FFT convolution with the reversed template
fn raw_cross_correlation(samples: &[f64], template: &[f64]) -> Vec<f64> {
    let n = samples.len();
    let m = template.len();
    let out_len = n - m + 1;
    let fft_len = (n + m - 1).next_power_of_two();

    let mut planner = RealFftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fft_len);
    let inverse = planner.plan_fft_inverse(fft_len);

    let mut padded = vec![0.0f64; fft_len];
    padded[..n].copy_from_slice(samples);
    let mut reversed = vec![0.0f64; fft_len];
    for (i, &t) in template.iter().enumerate() {
        reversed[m - 1 - i] = t;
    }

    let mut spectrum = forward.make_output_vec();
    let mut template_spectrum = forward.make_output_vec();
    forward.process(&mut padded, &mut spectrum).unwrap();
    forward.process(&mut reversed, &mut template_spectrum).unwrap();

    for (a, b) in spectrum.iter_mut().zip(template_spectrum.iter()) {
        *a = Complex::new(a.re * b.re - a.im * b.im, a.re * b.im + a.im * b.re);
    }
    // The inverse transform requires purely real DC and Nyquist bins
    spectrum[0].im = 0.0;
    if let Some(last) = spectrum.last_mut() {
        last.im = 0.0;
    }

    let mut convolved = vec![0.0f64; fft_len];
    inverse.process(&mut spectrum, &mut convolved).unwrap();

    let scale = 1.0 / fft_len as f64;
    (0..out_len).map(|k| convolved[k + m - 1] * scale).collect()
}

/// Sliding template-scaling detection criterion
///
/// At each offset the template is optimally fitted to the window with a free
/// scale and offset; the criterion is the fitted scale divided by the
/// residual standard deviation.
fn sliding_criterion(samples: &[f64], template: &[f64], raw_corr: &[f64]) -> Vec<f64> {
    let m = template.len();
    let mf = m as f64;
    let template_sum: f64 = template.iter().sum();
    let template_sumsq: f64 = template.iter().map(|t| t * t).sum();
    let template_var = template_sumsq - template_sum * template_sum / mf;
    if template_var <= 0.0 {
        return vec![0.0; raw_corr.len()];
    }

    let (prefix, prefix_sq) = prefix_sums(samples);

    raw_corr
        .iter()
        .enumerate()
        .map(|(k, &corr)| {
            let window_sum = prefix[k + m] - prefix[k];
            let window_sumsq = prefix_sq[k + m] - prefix_sq[k];

            let scale = (corr - template_sum * window_sum / mf) / template_var;
            let offset = (window_sum - scale * template_sum) / mf;
            let sse = window_sumsq + scale * scale * template_sumsq + mf * offset * offset
                - 2.0 * scale * corr
                - 2.0 * offset * window_sum
                + 2.0 * scale * offset * template_sum;

            let criterion = scale / (sse.max(0.0) / (mf - 1.0)).sqrt();
            if criterion.is_finite() {
                criterion
            } else {
                0.0
            }
        })
        .collect()
}

/// Normalized (Pearson) cross-correlation at every window position
fn normalized_correlation(samples: &[f64], template: &[f64], raw_corr: &[f64]) -> Vec<f64> {
    let m = template.len();
    let mf = m as f64;
    let template_sum: f64 = template.iter().sum();
    let template_sumsq: f64 = template.iter().map(|t| t * t).sum();
    let template_var = template_sumsq - template_sum * template_sum / mf;
    if template_var <= 0.0 {
        return vec![0.0; raw_corr.len()];
    }

    let (prefix, prefix_sq) = prefix_sums(samples);

    raw_corr
        .iter()
        .enumerate()
        .map(|(k, &corr)| {
            let window_sum = prefix[k + m] - prefix[k];
            let window_sumsq = prefix_sq[k + m] - prefix_sq[k];
            let window_var = window_sumsq - window_sum * window_sum / mf;
            if window_var <= 0.0 {
                return 0.0;
            }
            let covariance = corr - template_sum * window_sum / mf;
            let r = covariance / (template_var * window_var).sqrt();
            if r.is_finite() {
                r
            } else {
                0.0
            }
        })
        .collect()
}

fn prefix_sums(samples: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut prefix = Vec::with_capacity(samples.len() + 1);
    let mut prefix_sq = Vec::with_capacity(samples.len() + 1);
    prefix.push(0.0);
    prefix_sq.push(0.0);
    let mut sum = 0.0;
    let mut sumsq = 0.0;
    for &s in samples {
        sum += s;
        sumsq += s * s;
        prefix.push(sum);
        prefix_sq.push(sumsq);
    }
    (prefix, prefix_sq)
}
