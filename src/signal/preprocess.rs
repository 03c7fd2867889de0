// Signal preprocessing ahead of detection
// Fixed-order pipeline: detrend, DC removal, notch, lowpass

use serde::{Deserialize, Serialize};

use crate::recording::Channel;
use crate::signal::filters;

/// DC-offset removal strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DcOffset {
    /// Subtract a user-supplied value
    Value(f32),
    /// Subtract the estimated baseline (mean of the slice)
    Auto,
}

/// Low-pass filter family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterFamily {
    /// 4th-order IIR Butterworth
    Butterworth,
    /// Hamming-windowed-sinc FIR
    Hamming,
    /// Equiripple FIR (Parks-McClellan)
    Remez,
}

/// Notch filter settings (line-frequency removal)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NotchSettings {
    /// Line frequency in Hz (50 or 60 in practice)
    pub center_hz: f64,

    /// Filter quality factor; higher is narrower
    pub q: f64,
}

impl Default for NotchSettings {
    fn default() -> Self {
        NotchSettings {
            center_hz: 60.0,
            q: 10.0,
        }
    }
}

/// Low-pass filter settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LowpassSettings {
    pub family: FilterFamily,
    pub cutoff_hz: f64,
}

impl Default for LowpassSettings {
    fn default() -> Self {
        LowpassSettings {
            family: FilterFamily::Butterworth,
            cutoff_hz: 1000.0,
        }
    }
}

/// Preprocessing options, each independently toggleable
/// Applied in fixed order: detrend, DC removal, notch, lowpass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessOptions {
    /// Remove a least-squares linear trend over the whole slice
    pub detrend: bool,

    /// Remove a DC offset
    pub dc_offset: Option<DcOffset>,

    /// Notch out the line frequency
    pub notch: Option<NotchSettings>,

    /// Low-pass filter the slice
    pub lowpass: Option<LowpassSettings>,
}

/// Apply the enabled preprocessing steps to a channel slice
///
/// Returns a new channel carrying the `filtered` marker; a slice that already
/// carries the marker is returned unchanged, so re-invocation is a no-op.
/// The input is never mutated.
pub fn process(channel: &Channel, options: &PreprocessOptions) -> Channel {
    if channel.filtered {
        log::debug!("channel '{}' already filtered; skipping preprocessing", channel.id);
        return channel.clone();
    }

    let mut samples = channel.samples.clone();

    if options.detrend {
        detrend(&mut samples);
    }

    match options.dc_offset {
        Some(DcOffset::Value(v)) => {
            for s in samples.iter_mut() {
                *s -= v;
            }
        }
        Some(DcOffset::Auto) => {
            let mean = mean(&samples);
            for s in samples.iter_mut() {
                *s -= mean;
            }
        }
        None => {}
    }

    if let Some(notch) = options.notch {
        samples = filters::notch_filter(&samples, channel.sample_rate_hz, notch.center_hz, notch.q);
    }

    if let Some(lowpass) = options.lowpass {
        samples = match lowpass.family {
            FilterFamily::Butterworth => {
                filters::butterworth_lowpass(&samples, channel.sample_rate_hz, lowpass.cutoff_hz)
            }
            FilterFamily::Hamming => {
                filters::hamming_lowpass(&samples, channel.sample_rate_hz, lowpass.cutoff_hz)
            }
            FilterFamily::Remez => {
                filters::remez_lowpass(&samples, channel.sample_rate_hz, lowpass.cutoff_hz)
            }
        };
    }

    Channel {
        id: channel.id.clone(),
        samples,
        sample_rate_hz: channel.sample_rate_hz,
        units: channel.units.clone(),
        filtered: true,
    }
}

fn mean(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f32>() / samples.len() as f32
}

/// Subtract the least-squares line fit over the slice
/// Solved via the 2x2 normal equations
fn detrend(samples: &mut [f32]) {
    let n = samples.len();
    if n < 2 {
        return;
    }

    let nf = n as f64;
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    let mut sum_xx = 0.0f64;
    let mut sum_xy = 0.0f64;
    for (i, &s) in samples.iter().enumerate() {
        let x = i as f64;
        let y = s as f64;
        sum_x += x;
        sum_y += y;
        sum_xx += x * x;
        sum_xy += x * y;
    }

    let denom = nf * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return;
    }
    let slope = (nf * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / nf;

    for (i, s) in samples.iter_mut().enumerate() {
        *s -= (intercept + slope * i as f64) as f32;
    }
}
