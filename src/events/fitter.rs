// Bounded nonlinear least-squares fitting
// Levenberg-Marquardt over the five biexponential parameters with box constraints

use thiserror::Error;

use crate::events::model::{BiexpParams, ModelBounds};
use crate::events::types::FitResult;

/// Errors that can occur while fitting one candidate waveform
#[derive(Debug, Clone, Error)]
pub enum FitError {
    /// The optimizer failed: singular system or non-finite residuals
    #[error("fit diverged: {0}")]
    Divergence(String),

    /// Too few samples to constrain the five model parameters
    #[error("waveform too short to fit ({0} samples)")]
    TooShort(usize),
}

const MAX_ITERATIONS: usize = 100;
const LAMBDA_INITIAL: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e12;

/// Fit the biexponential model to a waveform slice
///
/// Bounds are repaired first (deterministically, warnings collected on the
/// result), then a Levenberg-Marquardt descent runs with every step clamped
/// to the repaired box. `accepted` is derived from `r2_threshold`.
pub fn fit(
    waveform: &[f32],
    bounds: &ModelBounds,
    sample_rate_hz: f64,
    r2_threshold: f64,
) -> Result<FitResult, FitError> {
    if waveform.len() < 8 {
        return Err(FitError::TooShort(waveform.len()));
    }

    let mut repaired = *bounds;
    let diagnostics = repaired.repair();
    for d in &diagnostics {
        log::warn!("bound repair: {}", d);
    }

    let dt_ms = 1000.0 / sample_rate_hz;
    let times: Vec<f64> = (0..waveform.len()).map(|i| i as f64 * dt_ms).collect();
    let values: Vec<f64> = waveform.iter().map(|&s| s as f64).collect();

    let lower = repaired.lower.to_array();
    let upper = repaired.upper.to_array();
    let mut params = repaired.initial.to_array();

    let mut sse = sum_squared_error(&times, &values, &params);
    if !sse.is_finite() {
        return Err(FitError::Divergence("non-finite residual at initial parameters".into()));
    }

    let mut lambda = LAMBDA_INITIAL;
    let mut singular_strikes = 0u32;

    for _iteration in 0..MAX_ITERATIONS {
        let (jtj, jtr) = normal_equations(&times, &values, &params);

        // Damped normal equations: (JtJ + lambda * diag(JtJ)) delta = Jtr
        let mut a = jtj;
        for i in 0..5 {
            a[i][i] += lambda * jtj[i][i].max(1e-12);
        }

        let delta = match solve5(a, jtr) {
            Some(d) => d,
            None => {
                singular_strikes += 1;
                if singular_strikes >= 5 {
                    return Err(FitError::Divergence("singular normal equations".into()));
                }
                lambda = (lambda * 10.0).min(LAMBDA_MAX);
                continue;
            }
        };

        let mut trial = [0.0f64; 5];
        for i in 0..5 {
            trial[i] = (params[i] + delta[i]).clamp(lower[i], upper[i]);
        }

        let trial_sse = sum_squared_error(&times, &values, &trial);
        if trial_sse.is_finite() && trial_sse < sse {
            let improvement = sse - trial_sse;
            let step: f64 = (0..5).map(|i| (trial[i] - params[i]).abs()).fold(0.0, f64::max);
            params = trial;
            sse = trial_sse;
            lambda = (lambda * 0.1).max(1e-12);
            singular_strikes = 0;
            if improvement < 1e-12 * sse.max(1e-12) || step < 1e-10 {
                break;
            }
        } else {
            if !trial_sse.is_finite() {
                singular_strikes += 1;
                if singular_strikes >= 5 {
                    return Err(FitError::Divergence("non-finite residual during descent".into()));
                }
            }
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                break; // no further progress possible; keep the best point
            }
        }
    }

    if !sse.is_finite() {
        return Err(FitError::Divergence("non-finite residual after descent".into()));
    }

    let coefficients = BiexpParams::from_array(params);
    let r2 = r_squared(&values, sse);
    let amplitude = coefficients.peak_amplitude();

    Ok(FitResult {
        coefficients,
        r2,
        amplitude,
        accepted: r2 >= r2_threshold,
        diagnostics,
    })
}

fn sum_squared_error(times: &[f64], values: &[f64], params: &[f64; 5]) -> f64 {
    let p = BiexpParams::from_array(*params);
    times
        .iter()
        .zip(values.iter())
        .map(|(&t, &y)| {
            let r = y - p.value_at(t);
            r * r
        })
        .sum()
}

/// Assemble JtJ and Jt*r with a forward-difference Jacobian
fn normal_equations(times: &[f64], values: &[f64], params: &[f64; 5]) -> ([[f64; 5]; 5], [f64; 5]) {
    let p = BiexpParams::from_array(*params);
    let base: Vec<f64> = times.iter().map(|&t| p.value_at(t)).collect();

    let mut jacobian = vec![[0.0f64; 5]; times.len()];
    for j in 0..5 {
        let h = 1e-6 * params[j].abs().max(1e-3);
        let mut bumped = *params;
        bumped[j] += h;
        let pb = BiexpParams::from_array(bumped);
        for (i, &t) in times.iter().enumerate() {
            jacobian[i][j] = (pb.value_at(t) - base[i]) / h;
        }
    }

    let mut jtj = [[0.0f64; 5]; 5];
    let mut jtr = [0.0f64; 5];
    for (i, &y) in values.iter().enumerate() {
        let residual = y - base[i];
        for r in 0..5 {
            jtr[r] += jacobian[i][r] * residual;
            for c in 0..5 {
                jtj[r][c] += jacobian[i][r] * jacobian[i][c];
            }
        }
    }
    (jtj, jtr)
}

/// Solve a 5x5 system by Gaussian elimination with partial pivoting
fn solve5(mut a: [[f64; 5]; 5], mut b: [f64; 5]) -> Option<[f64; 5]> {
    for col in 0..5 {
        let mut pivot_row = col;
        for row in (col + 1)..5 {
            if a[row][col].abs() > a[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        if a[pivot_row][col].abs() < 1e-30 {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..5 {
            let factor = a[row][col] / a[col][col];
            for k in col..5 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 5];
    for row in (0..5).rev() {
        let mut acc = b[row];
        for k in (row + 1)..5 {
            acc -= a[row][k] * x[k];
        }
        x[row] = acc / a[row][row];
        if !x[row].is_finite() {
            return None;
        }
    }
    Some(x)
}

/// Standard coefficient of determination, clamped to [0, 1]
fn r_squared(values: &[f64], sse: f64) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss_tot: f64 = values.iter().map(|&y| (y - mean) * (y - mean)).sum();
    if ss_tot <= 0.0 {
        return 0.0;
    }
    (1.0 - sse / ss_tot).clamp(0.0, 1.0)
}
