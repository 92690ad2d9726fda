//! Multitaper spectral estimation.

use std::cell::RefCell;
use std::f64::consts::SQRT_2;
use std::sync::Arc;

use ndarray::Array2;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

// Thread-local FFT planner so parallel channel workers reuse plans without
// sharing a lock.
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

pub(crate) fn fft_forward(len: usize) -> Arc<dyn Fft<f64>> {
    FFT_PLANNER.with(|planner| planner.borrow_mut().plan_fft_forward(len))
}

pub(crate) fn fft_inverse(len: usize) -> Arc<dyn Fft<f64>> {
    FFT_PLANNER.with(|planner| planner.borrow_mut().plan_fft_inverse(len))
}

/// Compute one-sided tapered spectra of a chunk.
///
/// The chunk is demeaned, multiplied element-wise by each taper, and
/// transformed; the result is a `(n_tapers, n_freqs)` complex matrix with
/// `n_freqs = n / 2 + 1` bins spanning 0..Nyquist, plus the frequency axis.
/// The DC bin (and the Nyquist bin for even-length chunks) is scaled by
/// `1/sqrt(2)` so one-sided power matches the two-sided transform.
pub fn mt_spectra(
    x: &[f64],
    tapers: &Array2<f64>,
    sfreq: f64,
) -> (Array2<Complex<f64>>, Vec<f64>) {
    let n = x.len();
    debug_assert_eq!(n, tapers.ncols());
    let n_freqs = n / 2 + 1;
    let mean = x.iter().sum::<f64>() / n as f64;

    let fft = fft_forward(n);
    let mut spectra = Array2::from_elem((tapers.nrows(), n_freqs), Complex::new(0.0, 0.0));
    let mut buf: Vec<Complex<f64>> = Vec::with_capacity(n);
    for (k, taper) in tapers.rows().into_iter().enumerate() {
        buf.clear();
        buf.extend(
            x.iter()
                .zip(taper.iter())
                .map(|(&v, &w)| Complex::new((v - mean) * w, 0.0)),
        );
        fft.process(&mut buf);
        for (f, value) in buf[..n_freqs].iter().enumerate() {
            spectra[[k, f]] = *value;
        }
        spectra[[k, 0]] /= SQRT_2;
        if n % 2 == 0 {
            spectra[[k, n_freqs - 1]] /= SQRT_2;
        }
    }

    let freqs = (0..n_freqs).map(|i| i as f64 * sfreq / n as f64).collect();
    (spectra, freqs)
}
