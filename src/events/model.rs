// Biexponential waveform model
// Shared by the detector (as a synthetic template) and the fitter (as target)

use serde::{Deserialize, Serialize};
use std::fmt;

/// The five biexponential model parameters
/// `y(t) = offset` before onset, then
/// `y(t) = offset + scale * (exp(-(t-onset)/tau_decay) - exp(-(t-onset)/tau_rise))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiexpParams {
    /// Baseline offset (alpha)
    pub offset: f64,

    /// Scale factor (beta); negative for inward events
    pub scale: f64,

    /// Event onset time in milliseconds (x0)
    pub onset_ms: f64,

    /// Rise time constant in milliseconds (tau1)
    pub tau_rise_ms: f64,

    /// Decay time constant in milliseconds (tau2)
    pub tau_decay_ms: f64,
}

/// Parameter names, in the canonical array order
pub const PARAM_NAMES: [&str; 5] = ["offset", "scale", "onset", "tau_rise", "tau_decay"];

impl BiexpParams {
    pub fn to_array(self) -> [f64; 5] {
        [
            self.offset,
            self.scale,
            self.onset_ms,
            self.tau_rise_ms,
            self.tau_decay_ms,
        ]
    }

    pub fn from_array(values: [f64; 5]) -> Self {
        BiexpParams {
            offset: values[0],
            scale: values[1],
            onset_ms: values[2],
            tau_rise_ms: values[3],
            tau_decay_ms: values[4],
        }
    }

    /// Evaluate the model at a single time point (milliseconds)
    pub fn value_at(&self, t_ms: f64) -> f64 {
        if t_ms < self.onset_ms {
            return self.offset;
        }
        let dt = t_ms - self.onset_ms;
        let tau_rise = self.tau_rise_ms.max(1e-6);
        let tau_decay = self.tau_decay_ms.max(1e-6);
        self.offset + self.scale * ((-dt / tau_decay).exp() - (-dt / tau_rise).exp())
    }

    /// Time of the model peak relative to the waveform origin, in milliseconds
    pub fn peak_time_ms(&self) -> f64 {
        let tau_rise = self.tau_rise_ms.max(1e-6);
        let tau_decay = self.tau_decay_ms.max(1e-6);
        if (tau_decay - tau_rise).abs() < 1e-9 {
            return self.onset_ms + tau_rise;
        }
        self.onset_ms + (tau_decay / tau_rise).ln() * tau_rise * tau_decay / (tau_decay - tau_rise)
    }

    /// Peak deviation of the model from its offset (signed)
    pub fn peak_amplitude(&self) -> f64 {
        self.value_at(self.peak_time_ms()) - self.offset
    }
}

/// Generate the model waveform over `[0, duration_ms)` at the given rate
/// Deterministic and analytic; no randomness
pub fn evaluate(params: &BiexpParams, duration_ms: f64, sample_rate_hz: f64) -> Vec<f32> {
    if sample_rate_hz <= 0.0 || duration_ms <= 0.0 {
        return Vec::new();
    }
    let n = (duration_ms / 1000.0 * sample_rate_hz).round() as usize;
    (0..n)
        .map(|i| {
            let t_ms = i as f64 * 1000.0 / sample_rate_hz;
            params.value_at(t_ms) as f32
        })
        .collect()
}

/// Non-fatal condition raised while repairing parameter bounds
/// Carried on fit results as a warning; never aborts a fit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// Lower bound exceeded the upper bound; the two were swapped
    BadBounds { param: String },

    /// Initial value fell outside the bounds; the bound was widened to it
    InfeasibleInitialValue { param: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::BadBounds { param } => {
                write!(f, "swapped inverted bounds for parameter '{}'", param)
            }
            Diagnostic::InfeasibleInitialValue { param } => {
                write!(f, "widened bounds to the initial value for parameter '{}'", param)
            }
        }
    }
}

/// Lower bound, initial value, and upper bound per model parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelBounds {
    pub lower: BiexpParams,
    pub initial: BiexpParams,
    pub upper: BiexpParams,
}

impl ModelBounds {
    /// Repair infeasible bounds in place, deterministically
    ///
    /// Per parameter, in order: swap inverted bounds, then widen the lower
    /// and upper bounds to cover the initial value. Returns the list of
    /// repairs performed; after the call `lower <= initial <= upper` holds
    /// for every parameter.
    pub fn repair(&mut self) -> Vec<Diagnostic> {
        let mut lower = self.lower.to_array();
        let mut initial_values = self.initial.to_array();
        let mut upper = self.upper.to_array();
        let mut diagnostics = Vec::new();

        for i in 0..5 {
            if lower[i] > upper[i] {
                std::mem::swap(&mut lower[i], &mut upper[i]);
                diagnostics.push(Diagnostic::BadBounds {
                    param: PARAM_NAMES[i].into(),
                });
            }
            if lower[i] > initial_values[i] {
                lower[i] = initial_values[i];
                diagnostics.push(Diagnostic::InfeasibleInitialValue {
                    param: PARAM_NAMES[i].into(),
                });
            }
            if upper[i] < initial_values[i] {
                upper[i] = initial_values[i];
                diagnostics.push(Diagnostic::InfeasibleInitialValue {
                    param: PARAM_NAMES[i].into(),
                });
            }
        }

        // NaN-safe: a non-finite initial value would poison the comparisons
        for i in 0..5 {
            if !initial_values[i].is_finite() {
                initial_values[i] = lower[i].min(upper[i]);
            }
        }

        self.lower = BiexpParams::from_array(lower);
        self.initial = BiexpParams::from_array(initial_values);
        self.upper = BiexpParams::from_array(upper);
        diagnostics
    }
}

impl Default for ModelBounds {
    fn default() -> Self {
        ModelBounds {
            lower: BiexpParams {
                offset: -100.0,
                scale: -500.0,
                onset_ms: 0.0,
                tau_rise_ms: 0.05,
                tau_decay_ms: 0.5,
            },
            initial: BiexpParams {
                offset: 0.0,
                scale: -20.0,
                onset_ms: 5.0,
                tau_rise_ms: 0.5,
                tau_decay_ms: 5.0,
            },
            upper: BiexpParams {
                offset: 100.0,
                scale: 500.0,
                onset_ms: 20.0,
                tau_rise_ms: 5.0,
                tau_decay_ms: 50.0,
            },
        }
    }
}
