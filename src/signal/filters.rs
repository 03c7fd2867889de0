// Filter design and application
// Biquad IIR sections plus windowed-sinc and equiripple FIR lowpass designs

use std::f64::consts::PI;

/// Normalized biquad coefficients (a0 divided out)
#[derive(Debug, Clone, Copy)]
struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

/// One second-order IIR section, transposed direct form II
#[derive(Debug, Clone, Copy)]
struct BiquadSection {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl BiquadSection {
    fn new(coeffs: BiquadCoeffs) -> Self {
        BiquadSection {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn process(&mut self, input: f64) -> f64 {
        let y = self.coeffs.b0 * input + self.z1;
        self.z1 = self.coeffs.b1 * input - self.coeffs.a1 * y + self.z2;
        self.z2 = self.coeffs.b2 * input - self.coeffs.a2 * y;
        y
    }
}

fn nyquist_clamp(freq_hz: f64, sample_rate_hz: f64) -> f64 {
    let nyquist = sample_rate_hz * 0.5;
    freq_hz.clamp(0.01, nyquist - 0.01)
}

fn normalize(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> BiquadCoeffs {
    let a0_inv = 1.0 / a0;
    BiquadCoeffs {
        b0: b0 * a0_inv,
        b1: b1 * a0_inv,
        b2: b2 * a0_inv,
        a1: a1 * a0_inv,
        a2: a2 * a0_inv,
    }
}

fn notch_coeffs(center_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * center_hz / sample_rate_hz;
    let alpha = (w0 / 2.0).sin() / (2.0 * q.max(0.1));
    let cos_w0 = w0.cos();
    let b0 = 1.0;
    let b1 = -2.0 * cos_w0;
    let b2 = 1.0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}

fn lowpass_coeffs(cutoff_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * cutoff_hz / sample_rate_hz;
    let alpha = (w0 / 2.0).sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 - cos_w0) * 0.5;
    let b1 = 1.0 - cos_w0;
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}

fn run_cascade(samples: &[f32], sections: &mut [BiquadSection]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| {
            let mut value = s as f64;
            for section in sections.iter_mut() {
                value = section.process(value);
            }
            value as f32
        })
        .collect()
}

/// Remove a narrow band around the line frequency
pub fn notch_filter(samples: &[f32], sample_rate_hz: f64, center_hz: f64, q: f64) -> Vec<f32> {
    let center = nyquist_clamp(center_hz, sample_rate_hz);
    let mut sections = [BiquadSection::new(notch_coeffs(center, sample_rate_hz, q))];
    run_cascade(samples, &mut sections)
}

/// 4th-order Butterworth lowpass as a cascade of two biquad sections
pub fn butterworth_lowpass(samples: &[f32], sample_rate_hz: f64, cutoff_hz: f64) -> Vec<f32> {
    let cutoff = nyquist_clamp(cutoff_hz, sample_rate_hz);
    // Pole Q values for a 4th-order Butterworth response
    let mut sections = [
        BiquadSection::new(lowpass_coeffs(cutoff, sample_rate_hz, 0.541_196_1)),
        BiquadSection::new(lowpass_coeffs(cutoff, sample_rate_hz, 1.306_563_0)),
    ];
    run_cascade(samples, &mut sections)
}

/// Default FIR length for the windowed and equiripple designs
pub const FIR_TAPS: usize = 63;

/// Hamming-windowed-sinc lowpass taps, normalized to unit DC gain
pub fn design_hamming_lowpass(n_taps: usize, cutoff_norm: f64) -> Vec<f64> {
    let n_taps = if n_taps % 2 == 0 { n_taps + 1 } else { n_taps };
    let half = (n_taps - 1) as f64 / 2.0;
    let fc = cutoff_norm.clamp(1e-4, 0.499);

    let mut taps: Vec<f64> = (0..n_taps)
        .map(|i| {
            let m = i as f64 - half;
            let sinc = if m.abs() < 1e-12 {
                2.0 * fc
            } else {
                (2.0 * PI * fc * m).sin() / (PI * m)
            };
            let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / (n_taps - 1) as f64).cos();
            sinc * window
        })
        .collect();

    let sum: f64 = taps.iter().sum();
    if sum.abs() > 1e-12 {
        for t in taps.iter_mut() {
            *t /= sum;
        }
    }
    taps
}

/// Equiripple (Parks-McClellan exchange) linear-phase lowpass taps
/// Transition band spans roughly ±25% around the cutoff
pub fn design_remez_lowpass(n_taps: usize, cutoff_norm: f64) -> Vec<f64> {
    let n_taps = if n_taps % 2 == 0 { n_taps + 1 } else { n_taps };
    let half = (n_taps - 1) / 2;
    let r = half + 1; // cosine basis size
    let m = r + 1; // extremal point count

    let fc = cutoff_norm.clamp(1e-3, 0.45);
    let pass_edge = (fc * 0.75).max(5e-4);
    let stop_edge = (fc * 1.25).min(0.499);

    // Dense grid over passband and stopband, points split by band width
    let grid_size = (r * 16).max(64);
    let pass_w = pass_edge;
    let stop_w = 0.5 - stop_edge;
    let n_pass = (((grid_size as f64) * pass_w / (pass_w + stop_w)).round() as usize).clamp(8, grid_size - 8);
    let n_stop = grid_size - n_pass;

    let mut grid: Vec<(f64, f64)> = Vec::with_capacity(grid_size); // (freq, desired)
    for i in 0..n_pass {
        grid.push((pass_edge * i as f64 / (n_pass - 1) as f64, 1.0));
    }
    for i in 0..n_stop {
        grid.push((stop_edge + (0.5 - stop_edge) * i as f64 / (n_stop - 1) as f64, 0.0));
    }

    // Initial extremal points spread evenly across the grid
    let mut ext: Vec<usize> = (0..m).map(|k| k * (grid.len() - 1) / (m - 1)).collect();

    let mut x = vec![0.0f64; m];
    let mut wts = vec![0.0f64; m];
    let mut c = vec![0.0f64; m];
    let mut converged_delta = 0.0f64;

    for _iteration in 0..25 {
        for k in 0..m {
            x[k] = (2.0 * PI * grid[ext[k]].0).cos();
        }
        for k in 0..m {
            let mut w = 1.0;
            for j in 0..m {
                if j != k {
                    w /= x[k] - x[j];
                }
            }
            wts[k] = w;
        }

        let mut num = 0.0;
        let mut den = 0.0;
        for k in 0..m {
            num += wts[k] * grid[ext[k]].1;
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            den += sign * wts[k];
        }
        if den.abs() < 1e-300 || !den.is_finite() {
            break;
        }
        let delta = num / den;
        converged_delta = delta;

        for k in 0..m {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            c[k] = grid[ext[k]].1 - sign * delta;
        }

        // Weighted error over the whole grid
        let err: Vec<f64> = grid
            .iter()
            .map(|&(f, d)| interpolate(&x, &wts, &c, (2.0 * PI * f).cos()) - d)
            .collect();

        // Candidate extrema: local maxima of |err| per band, band edges included
        // The two bands are scanned separately so the passband/stopband
        // junction cannot mask an edge extremum
        let mut candidates: Vec<usize> = Vec::new();
        for (band_start, band_end) in [(0, n_pass), (n_pass, grid.len())] {
            for i in band_start..band_end {
                let left = if i == band_start {
                    true
                } else {
                    err[i].abs() >= err[i - 1].abs()
                };
                let right = if i + 1 == band_end {
                    true
                } else {
                    err[i].abs() > err[i + 1].abs()
                };
                if left && right {
                    candidates.push(i);
                }
            }
        }

        // Enforce sign alternation: of adjacent same-sign candidates keep the larger
        let mut alternating: Vec<usize> = Vec::with_capacity(candidates.len());
        for &i in &candidates {
            match alternating.last() {
                Some(&prev) if err[prev].signum() == err[i].signum() => {
                    if err[i].abs() > err[prev].abs() {
                        *alternating.last_mut().unwrap() = i;
                    }
                }
                _ => alternating.push(i),
            }
        }

        if alternating.len() < m {
            break; // degenerate error curve; keep the current solution
        }
        // Trim to m points by dropping the weaker endpoint
        while alternating.len() > m {
            let first = alternating[0];
            let last = *alternating.last().unwrap();
            if err[first].abs() < err[last].abs() {
                alternating.remove(0);
            } else {
                alternating.pop();
            }
        }

        let max_err = alternating.iter().map(|&i| err[i].abs()).fold(0.0f64, f64::max);
        let settled = ext == alternating;
        ext = alternating;
        if settled || (max_err - delta.abs()).abs() <= 1e-6 * delta.abs().max(1e-12) {
            // Recompute the basis for the final extremal set before synthesis
            for k in 0..m {
                x[k] = (2.0 * PI * grid[ext[k]].0).cos();
            }
            for k in 0..m {
                let mut w = 1.0;
                for j in 0..m {
                    if j != k {
                        w /= x[k] - x[j];
                    }
                }
                wts[k] = w;
            }
            for k in 0..m {
                let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                c[k] = grid[ext[k]].1 - sign * converged_delta;
            }
            break;
        }
    }

    // Synthesize the impulse response from frequency samples of A(f)
    let nt = n_taps as f64;
    let a: Vec<f64> = (0..=half)
        .map(|k| interpolate(&x, &wts, &c, (2.0 * PI * k as f64 / nt).cos()))
        .collect();
    let mut taps = vec![0.0f64; n_taps];
    for n in 0..=half {
        let mut acc = a[0];
        for (k, &ak) in a.iter().enumerate().skip(1) {
            acc += 2.0 * ak * (2.0 * PI * k as f64 * n as f64 / nt).cos();
        }
        let v = acc / nt;
        taps[half + n] = v;
        taps[half - n] = v;
    }
    taps
}

/// Barycentric Lagrange interpolation on the cosine-domain basis
fn interpolate(x: &[f64], wts: &[f64], c: &[f64], xf: f64) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for k in 0..x.len() {
        let dx = xf - x[k];
        if dx.abs() < 1e-12 {
            return c[k];
        }
        let t = wts[k] / dx;
        num += t * c[k];
        den += t;
    }
    num / den
}

/// Apply a linear-phase FIR with its group delay compensated
/// Edges are handled by replicating the first/last sample
pub fn fir_apply(samples: &[f32], taps: &[f64]) -> Vec<f32> {
    if samples.is_empty() || taps.is_empty() {
        return samples.to_vec();
    }
    let half = (taps.len() - 1) as isize / 2;
    let n = samples.len() as isize;
    (0..n)
        .map(|i| {
            let mut acc = 0.0f64;
            for (j, &t) in taps.iter().enumerate() {
                let idx = (i + j as isize - half).clamp(0, n - 1) as usize;
                acc += t * samples[idx] as f64;
            }
            acc as f32
        })
        .collect()
}

/// Hamming-windowed FIR lowpass, delay-compensated
pub fn hamming_lowpass(samples: &[f32], sample_rate_hz: f64, cutoff_hz: f64) -> Vec<f32> {
    let cutoff = nyquist_clamp(cutoff_hz, sample_rate_hz);
    let taps = design_hamming_lowpass(FIR_TAPS, cutoff / sample_rate_hz);
    fir_apply(samples, &taps)
}

/// Equiripple FIR lowpass, delay-compensated
pub fn remez_lowpass(samples: &[f32], sample_rate_hz: f64, cutoff_hz: f64) -> Vec<f32> {
    let cutoff = nyquist_clamp(cutoff_hz, sample_rate_hz);
    let taps = design_remez_lowpass(FIR_TAPS, cutoff / sample_rate_hz);
    fir_apply(samples, &taps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq_hz: f64, sample_rate_hz: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq_hz * i as f64 / sample_rate_hz).sin() as f32)
            .collect()
    }

    fn rms(samples: &[f32]) -> f64 {
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    #[test]
    fn test_notch_removes_line_frequency() {
        let rate = 1000.0;
        let signal = sine(60.0, rate, 2000);
        let filtered = notch_filter(&signal, rate, 60.0, 10.0);

        // Measure after the startup transient has decayed
        let tail_in = rms(&signal[1000..]);
        let tail_out = rms(&filtered[1000..]);
        assert!(tail_out < 0.1 * tail_in, "notch left {} of {}", tail_out, tail_in);
    }

    #[test]
    fn test_notch_preserves_distant_frequency() {
        let rate = 1000.0;
        let signal = sine(5.0, rate, 2000);
        let filtered = notch_filter(&signal, rate, 60.0, 10.0);
        let tail_in = rms(&signal[1000..]);
        let tail_out = rms(&filtered[1000..]);
        assert!((tail_out - tail_in).abs() < 0.05 * tail_in);
    }

    #[test]
    fn test_butterworth_passes_dc() {
        let rate = 1000.0;
        let signal = vec![1.0f32; 1000];
        let filtered = butterworth_lowpass(&signal, rate, 50.0);
        assert!((filtered[999] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_butterworth_attenuates_stopband() {
        let rate = 1000.0;
        let signal = sine(400.0, rate, 2000);
        let filtered = butterworth_lowpass(&signal, rate, 50.0);
        assert!(rms(&filtered[1000..]) < 0.05 * rms(&signal[1000..]));
    }

    #[test]
    fn test_hamming_taps_symmetric_and_unit_gain() {
        let taps = design_hamming_lowpass(FIR_TAPS, 0.05);
        assert_eq!(taps.len(), FIR_TAPS);
        for i in 0..taps.len() / 2 {
            assert!((taps[i] - taps[taps.len() - 1 - i]).abs() < 1e-12);
        }
        let dc_gain: f64 = taps.iter().sum();
        assert!((dc_gain - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_hamming_attenuates_stopband() {
        let rate = 1000.0;
        let signal = sine(400.0, rate, 2000);
        let filtered = hamming_lowpass(&signal, rate, 50.0);
        assert!(rms(&filtered[200..1800]) < 0.05 * rms(&signal));
    }

    #[test]
    fn test_remez_taps_symmetric_and_near_unit_gain() {
        let taps = design_remez_lowpass(FIR_TAPS, 0.05);
        assert_eq!(taps.len(), FIR_TAPS);
        for i in 0..taps.len() / 2 {
            assert!((taps[i] - taps[taps.len() - 1 - i]).abs() < 1e-9);
        }
        let dc_gain: f64 = taps.iter().sum();
        assert!((dc_gain - 1.0).abs() < 0.05, "DC gain {}", dc_gain);
    }

    #[test]
    fn test_remez_attenuates_stopband() {
        let rate = 1000.0;
        let signal = sine(400.0, rate, 2000);
        let filtered = remez_lowpass(&signal, rate, 50.0);
        assert!(rms(&filtered[200..1800]) < 0.1 * rms(&signal));
    }

    #[test]
    fn test_fir_apply_preserves_length_and_dc() {
        let taps = design_hamming_lowpass(31, 0.1);
        let signal = vec![2.5f32; 500];
        let out = fir_apply(&signal, &taps);
        assert_eq!(out.len(), signal.len());
        // Edge replication keeps DC exact even at the boundaries
        assert!((out[0] - 2.5).abs() < 1e-4);
        assert!((out[250] - 2.5).abs() < 1e-4);
    }
}
