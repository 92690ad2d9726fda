//! Discrete prolate spheroidal sequence (DPSS) tapers and the keyed
//! taper/threshold cache shared by all chunks of one filtering call.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use ndarray::Array2;
use rustfft::num_complex::Complex;

use crate::error::{NotchError, Result};
use crate::ftest::f_threshold;
use crate::spectra::{fft_forward, fft_inverse};

/// A taper matrix with its spectral concentrations and the F-test threshold
/// for the owning bank's p-value.
#[derive(Debug, Clone)]
pub struct TaperSet {
    /// `(n_tapers, window_length)` DPSS matrix, rows have unit energy.
    pub tapers: Array2<f64>,
    /// In-band energy concentration of each taper, descending, in (0, 1].
    pub concentrations: Vec<f64>,
    /// Whether adaptive spectral combination is possible (needs >= 3 tapers).
    pub adaptive: bool,
    /// Bonferroni-corrected F-statistic cutoff for this window length.
    pub threshold: f64,
}

impl TaperSet {
    pub fn n_tapers(&self) -> usize {
        self.tapers.nrows()
    }

    pub fn window_len(&self) -> usize {
        self.tapers.ncols()
    }
}

/// Compute the `k_max` most concentrated DPSS tapers of length `n` for a
/// time half-bandwidth product `half_nbw`.
///
/// The tapers are the top eigenvectors of the classic symmetric tridiagonal
/// operator (Slepian's formulation); eigenvalues are located by Sturm-count
/// bisection and eigenvectors refined by inverse iteration. Concentrations
/// are evaluated with the autocorrelation method. With `low_bias` only
/// tapers with more than 90% in-band concentration are kept (falling back to
/// the single best taper if none qualify).
pub fn dpss_windows(
    n: usize,
    half_nbw: f64,
    k_max: usize,
    low_bias: bool,
) -> Result<(Array2<f64>, Vec<f64>)> {
    if n < 2 {
        return Err(NotchError::TaperDesign(format!(
            "cannot design tapers for a {n}-sample window"
        )));
    }
    if !(half_nbw > 0.0) || half_nbw >= n as f64 / 2.0 {
        return Err(NotchError::TaperDesign(format!(
            "half-bandwidth product {half_nbw} is out of range for {n} samples"
        )));
    }
    let k_max = k_max.clamp(1, n);
    let w = half_nbw / n as f64;

    // Tridiagonal operator: diagonal ((N-1-2i)/2)^2 cos(2πW), off-diagonal
    // i(N-i)/2. Its top eigenvectors are the DPSS in concentration order.
    let cos_2pi_w = (2.0 * PI * w).cos();
    let diag: Vec<f64> = (0..n)
        .map(|i| {
            let t = (n as i64 - 1 - 2 * i as i64) as f64 / 2.0;
            t * t * cos_2pi_w
        })
        .collect();
    let off: Vec<f64> = (1..n).map(|i| (i * (n - i)) as f64 / 2.0).collect();

    // Gershgorin bounds for the bisection interval.
    let mut lower = f64::INFINITY;
    let mut upper = f64::NEG_INFINITY;
    for i in 0..n {
        let mut radius = 0.0;
        if i > 0 {
            radius += off[i - 1].abs();
        }
        if i < n - 1 {
            radius += off[i].abs();
        }
        lower = lower.min(diag[i] - radius);
        upper = upper.max(diag[i] + radius);
    }

    let mut tapers = Array2::zeros((k_max, n));
    let mut found: Vec<Vec<f64>> = Vec::with_capacity(k_max);
    for k in 0..k_max {
        // k-th taper pairs with the (k+1)-th largest eigenvalue
        let eigenvalue = bisect_eigenvalue(&diag, &off, lower, upper, n - 1 - k);
        let mut v = inverse_iteration(&diag, &off, eigenvalue, &found, k);
        fix_taper_sign(&mut v, k);
        for (i, &value) in v.iter().enumerate() {
            tapers[[k, i]] = value;
        }
        found.push(v);
    }

    let concentrations = band_concentrations(&tapers, w);

    if low_bias {
        let mut keep: Vec<usize> = (0..k_max).filter(|&k| concentrations[k] > 0.9).collect();
        if keep.is_empty() {
            // nothing clears 90%; keep the single most concentrated taper
            let best = concentrations
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0);
            keep.push(best);
        }
        if keep.len() < k_max {
            let mut kept = Array2::zeros((keep.len(), n));
            let mut kept_conc = Vec::with_capacity(keep.len());
            for (row, &k) in keep.iter().enumerate() {
                kept.row_mut(row).assign(&tapers.row(k));
                kept_conc.push(concentrations[k]);
            }
            return Ok((kept, kept_conc));
        }
    }
    Ok((tapers, concentrations))
}

/// Number of sign changes in the Sturm sequence = number of eigenvalues
/// strictly below `x`.
fn sturm_count(diag: &[f64], off: &[f64], x: f64) -> usize {
    let mut count = 0;
    let mut q = 1.0;
    for (i, &d) in diag.iter().enumerate() {
        q = if i == 0 { d - x } else { d - x - off[i - 1] * off[i - 1] / q };
        if q == 0.0 {
            q = -f64::MIN_POSITIVE;
        }
        if q < 0.0 {
            count += 1;
        }
    }
    count
}

/// Locate the eigenvalue with ascending index `target` by bisection.
fn bisect_eigenvalue(diag: &[f64], off: &[f64], mut lower: f64, mut upper: f64, target: usize) -> f64 {
    let scale = lower.abs().max(upper.abs()).max(1.0);
    for _ in 0..200 {
        let mid = 0.5 * (lower + upper);
        if sturm_count(diag, off, mid) > target {
            upper = mid;
        } else {
            lower = mid;
        }
        if upper - lower <= f64::EPSILON * scale {
            break;
        }
    }
    0.5 * (lower + upper)
}

/// Inverse iteration for the eigenvector of a shifted tridiagonal system,
/// re-orthogonalized against previously found eigenvectors.
fn inverse_iteration(
    diag: &[f64],
    off: &[f64],
    eigenvalue: f64,
    previous: &[Vec<f64>],
    seed: usize,
) -> Vec<f64> {
    let n = diag.len();
    // deterministic pseudo-random start so no eigenvector is missed
    let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ (seed as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    let mut v: Vec<f64> = (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
        })
        .collect();
    normalize(&mut v);

    for _ in 0..4 {
        v = solve_shifted(diag, off, eigenvalue, &v);
        for p in previous {
            let dot: f64 = v.iter().zip(p).map(|(a, b)| a * b).sum();
            for (a, b) in v.iter_mut().zip(p) {
                *a -= dot * b;
            }
        }
        normalize(&mut v);
    }
    v
}

fn normalize(v: &mut [f64]) {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Solve `(T - eigenvalue * I) out = b` for tridiagonal `T` with Gaussian
/// elimination and partial pivoting (one superdiagonal of fill-in).
fn solve_shifted(diag: &[f64], off: &[f64], eigenvalue: f64, b: &[f64]) -> Vec<f64> {
    let n = diag.len();
    let mut d: Vec<f64> = diag.iter().map(|&x| x - eigenvalue).collect();
    let mut u = off.to_vec();
    let mut w = vec![0.0; n];
    let mut l = off.to_vec();
    let mut rhs = b.to_vec();

    for i in 0..n - 1 {
        if l[i].abs() > d[i].abs() {
            std::mem::swap(&mut d[i], &mut l[i]);
            {
                let (left, right) = (u[i], d[i + 1]);
                u[i] = right;
                d[i + 1] = left;
            }
            if i + 2 < n {
                let (left, right) = (w[i], u[i + 1]);
                w[i] = right;
                u[i + 1] = left;
            }
            rhs.swap(i, i + 1);
        }
        if d[i] == 0.0 {
            d[i] = f64::MIN_POSITIVE;
        }
        let m = l[i] / d[i];
        d[i + 1] -= m * u[i];
        if i + 2 < n {
            u[i + 1] -= m * w[i];
        }
        rhs[i + 1] -= m * rhs[i];
    }
    if d[n - 1] == 0.0 {
        d[n - 1] = f64::MIN_POSITIVE;
    }

    let mut out = vec![0.0; n];
    for i in (0..n).rev() {
        let mut s = rhs[i];
        if i + 1 < n {
            s -= u[i] * out[i + 1];
        }
        if i + 2 < n {
            s -= w[i] * out[i + 2];
        }
        out[i] = s / d[i];
    }
    out
}

/// Conventional polarity: symmetric tapers (even k) have positive mean,
/// antisymmetric tapers (odd k) begin with a positive lobe.
fn fix_taper_sign(v: &mut [f64], k: usize) {
    let flip = if k % 2 == 0 {
        v.iter().sum::<f64>() < 0.0
    } else {
        let max_abs = v.iter().fold(0.0f64, |m, x| m.max(x.abs()));
        v.iter()
            .find(|x| x.abs() > max_abs * 1e-6)
            .map(|&x| x < 0.0)
            .unwrap_or(false)
    };
    if flip {
        for x in v.iter_mut() {
            *x = -*x;
        }
    }
}

/// In-band energy concentration of each taper via the autocorrelation
/// method: lambda = sum_m r_xx[m] * K[m] with K[0] = 2W and
/// K[m] = 2 sin(2πWm) / (πm).
fn band_concentrations(tapers: &Array2<f64>, w: f64) -> Vec<f64> {
    let n = tapers.ncols();
    let n_fft = (2 * n).next_power_of_two();
    let forward = fft_forward(n_fft);
    let inverse = fft_inverse(n_fft);

    let mut kernel = vec![0.0; n];
    kernel[0] = 2.0 * w;
    for (m, value) in kernel.iter_mut().enumerate().skip(1) {
        *value = 2.0 * (2.0 * PI * w * m as f64).sin() / (PI * m as f64);
    }

    tapers
        .rows()
        .into_iter()
        .map(|row| {
            let mut buf: Vec<Complex<f64>> =
                row.iter().map(|&x| Complex::new(x, 0.0)).collect();
            buf.resize(n_fft, Complex::new(0.0, 0.0));
            forward.process(&mut buf);
            for c in buf.iter_mut() {
                *c = Complex::new(c.norm_sqr(), 0.0);
            }
            inverse.process(&mut buf);
            let scale = 1.0 / n_fft as f64;
            kernel
                .iter()
                .zip(&buf)
                .map(|(&k, c)| k * c.re * scale)
                .sum()
        })
        .collect()
}

/// Resolve the taper parameters for one window length.
///
/// The default bandwidth picks a time half-bandwidth product of 4; an
/// explicit bandwidth maps to `half_nbw = bandwidth * n / (2 * sfreq)` and
/// must leave at least 0.5. Adaptive combination is demoted with a warning
/// when fewer than 3 tapers survive.
pub(crate) fn mt_params(
    n_times: usize,
    sfreq: f64,
    bandwidth: Option<f64>,
    low_bias: bool,
    adaptive: bool,
) -> Result<(Array2<f64>, Vec<f64>, bool)> {
    let half_nbw = match bandwidth {
        Some(bw) if bw < 0.0 => {
            return Err(NotchError::InvalidParameter(format!(
                "mt_bandwidth must be >= 0 Hz, got {bw}"
            )))
        }
        Some(bw) => bw * n_times as f64 / (2.0 * sfreq),
        None => 4.0,
    };
    if half_nbw < 0.5 {
        return Err(NotchError::TaperDesign(format!(
            "a {n_times}-sample window at {sfreq} Hz cannot resolve the requested bandwidth \
             (time half-bandwidth product {half_nbw:.3} < 0.5)"
        )));
    }
    let k_max = (2.0 * half_nbw) as usize;
    let (tapers, concentrations) = dpss_windows(n_times, half_nbw, k_max, low_bias)?;

    let mut adaptive = adaptive;
    if adaptive && tapers.nrows() < 3 {
        log::warn!(
            "not adaptively combining spectral estimates: only {} taper(s) available (need at least 3)",
            tapers.nrows()
        );
        adaptive = false;
    }
    Ok((tapers, concentrations, adaptive))
}

/// Memoized taper sets for one filtering invocation.
///
/// The cache key is the window length; sampling rate, bandwidth, taper
/// policy, and p-value are fixed at construction, so together they form the
/// full `(window_length, sfreq, bandwidth, policy)` key from the caller's
/// point of view. The final chunk of a channel is usually shorter than the
/// rest, so a second length showing up is expected, not an error.
///
/// Lookups are safe across worker threads; recomputation for a new length
/// happens outside the lock, and a racing duplicate computation yields an
/// identical set (first insert wins).
#[derive(Debug)]
pub struct TaperBank {
    sfreq: f64,
    bandwidth: Option<f64>,
    low_bias: bool,
    adaptive: bool,
    p_value: f64,
    cache: Mutex<HashMap<usize, Arc<TaperSet>>>,
}

impl TaperBank {
    pub fn new(
        sfreq: f64,
        bandwidth: Option<f64>,
        low_bias: bool,
        adaptive: bool,
        p_value: f64,
    ) -> Self {
        Self {
            sfreq,
            bandwidth,
            low_bias,
            adaptive,
            p_value,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or compute) the taper set and F-test threshold for a window
    /// length.
    pub fn get(&self, n_times: usize) -> Result<Arc<TaperSet>> {
        if let Some(set) = self.cache.lock().unwrap().get(&n_times) {
            return Ok(Arc::clone(set));
        }

        let (tapers, concentrations, adaptive) = mt_params(
            n_times,
            self.sfreq,
            self.bandwidth,
            self.low_bias,
            self.adaptive,
        )?;
        let threshold = f_threshold(self.p_value, n_times, tapers.nrows())?;
        log::debug!(
            "designed {} taper(s) for {}-sample windows, F threshold {:.2}",
            tapers.nrows(),
            n_times,
            threshold
        );
        let set = Arc::new(TaperSet {
            tapers,
            concentrations,
            adaptive,
            threshold,
        });

        let mut cache = self.cache.lock().unwrap();
        Ok(Arc::clone(cache.entry(n_times).or_insert(set)))
    }
}
