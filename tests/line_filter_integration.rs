//! End-to-end tests for the multitaper line-noise filter.

use std::f64::consts::PI;

use mtnotch::{
    line_filter, line_filter_epochs, ChunkLength, LineFilterConfig, NotchError, NotchWidths,
    Picks, ReportKind,
};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Gaussian noise via Box-Muller, deterministic per seed.
fn white_noise(n: usize, sigma: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let u1: f64 = 1.0 - rng.random::<f64>();
            let u2: f64 = rng.random();
            sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
        })
        .collect()
}

fn sine(n: usize, sfreq: f64, freq: f64, amp: f64) -> Vec<f64> {
    (0..n)
        .map(|t| amp * (2.0 * PI * freq * t as f64 / sfreq).sin())
        .collect()
}

/// Amplitude of the component at `freq` via a single-frequency DFT.
fn amplitude_at(x: &[f64], sfreq: f64, freq: f64) -> f64 {
    let n = x.len() as f64;
    let (mut re, mut im) = (0.0, 0.0);
    for (t, &v) in x.iter().enumerate() {
        let phase = 2.0 * PI * freq * t as f64 / sfreq;
        re += v * phase.cos();
        im -= v * phase.sin();
    }
    2.0 * (re * re + im * im).sqrt() / n
}

fn rms(x: &[f64]) -> f64 {
    (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
}

/// The reference scenario: 60 Hz hum on channel 0, pure noise on channel 1,
/// targeted removal over the whole signal as one window.
#[test]
fn targeted_removal_cleans_the_noisy_channel_only() {
    init_logging();
    let sfreq = 1000.0;
    let n = 1000;
    let hum = sine(n, sfreq, 60.0, 1.0);
    let noise0 = white_noise(n, 0.1, 11);
    let noise1 = white_noise(n, 0.1, 12);

    let mut data = Array2::zeros((2, n));
    for t in 0..n {
        data[[0, t]] = hum[t] + noise0[t];
        data[[1, t]] = noise1[t];
    }

    let config = LineFilterConfig {
        freqs: Some(vec![60.0]),
        notch_widths: Some(NotchWidths::PerFreq(vec![10.0])),
        chunk_length: ChunkLength::Samples(n),
        ..LineFilterConfig::new(sfreq)
    };
    let (filtered, report) = line_filter(&data, &config).unwrap();

    assert_eq!(filtered.dim(), data.dim());

    let ch0_in: Vec<f64> = data.row(0).to_vec();
    let ch0_out: Vec<f64> = filtered.row(0).to_vec();
    let before = amplitude_at(&ch0_in, sfreq, 60.0);
    let after = amplitude_at(&ch0_out, sfreq, 60.0);
    assert!(before > 0.9, "injected hum amplitude {before}");
    assert!(
        after < 0.1 * before,
        "60 Hz amplitude only dropped from {before} to {after}"
    );

    // the pure-noise channel is statistically unchanged
    let ch1_in: Vec<f64> = data.row(1).to_vec();
    let ch1_out: Vec<f64> = filtered.row(1).to_vec();
    let diff: Vec<f64> = ch1_in.iter().zip(&ch1_out).map(|(a, b)| a - b).collect();
    assert!(rms(&diff) < 0.01 * rms(&ch1_in));

    assert_eq!(report.kind, ReportKind::Removed);
    assert_eq!(report.windows_at(60.0), 1);
}

/// Clean noise with a strict p-value passes through the chunked pipeline
/// untouched, which also exercises exact overlap-add reconstruction.
#[test]
fn clean_noise_is_not_modified() {
    init_logging();
    let sfreq = 1000.0;
    let n = 1000;
    let mut data = Array2::zeros((2, n));
    for (ch, seed) in [(0, 21), (1, 22)] {
        let noise = white_noise(n, 1.0, seed);
        for t in 0..n {
            data[[ch, t]] = noise[t];
        }
    }

    let config = LineFilterConfig {
        freqs: None,
        chunk_length: "300ms".parse().unwrap(),
        p_value: 1e-4,
        ..LineFilterConfig::new(sfreq)
    };
    let (filtered, report) = line_filter(&data, &config).unwrap();

    let max_diff = data
        .iter()
        .zip(filtered.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f64, f64::max);
    assert!(max_diff < 1e-9, "spurious removal, max diff {max_diff}");
    assert!(report.is_empty(), "unexpected report: {report}");
}

/// Chunked processing must match whole-signal processing statistically.
#[test]
fn chunked_processing_matches_single_window() {
    init_logging();
    let sfreq = 1000.0;
    let n = 1000;
    let noise = white_noise(n, 0.1, 31);
    let hum = sine(n, sfreq, 60.0, 1.0);
    let mut data = Array2::zeros((1, n));
    for t in 0..n {
        data[[0, t]] = hum[t] + noise[t];
    }

    let whole = LineFilterConfig {
        freqs: Some(vec![60.0]),
        notch_widths: Some(NotchWidths::Scalar(10.0)),
        chunk_length: ChunkLength::Samples(n),
        ..LineFilterConfig::new(sfreq)
    };
    let chunked = LineFilterConfig {
        chunk_length: ChunkLength::Seconds(0.3),
        ..whole.clone()
    };

    let (out_whole, _) = line_filter(&data, &whole).unwrap();
    let (out_chunked, report) = line_filter(&data, &chunked).unwrap();

    let amp_whole = amplitude_at(&out_whole.row(0).to_vec(), sfreq, 60.0);
    let amp_chunked = amplitude_at(&out_chunked.row(0).to_vec(), sfreq, 60.0);
    // both runs push the 60 Hz power into the noise floor (< 5% of a^2/2)
    assert!(amp_whole < 0.22, "whole-signal residual {amp_whole}");
    assert!(amp_chunked < 0.22, "chunked residual {amp_chunked}");
    // the hum is present in every analysis window
    assert!(report.windows_at(60.0) >= 3);
}

/// Auto-detect mode finds the same dominant sinusoid as targeted removal.
#[test]
fn auto_detect_matches_targeted_removal() {
    init_logging();
    let sfreq = 500.0;
    let n = 1000;
    let noise = white_noise(n, 0.05, 41);
    let hum = sine(n, sfreq, 50.0, 1.0);
    let mut data = Array2::zeros((1, n));
    for t in 0..n {
        data[[0, t]] = hum[t] + noise[t];
    }

    let targeted = LineFilterConfig {
        freqs: Some(vec![50.0]),
        notch_widths: Some(NotchWidths::Scalar(20.0)),
        chunk_length: ChunkLength::Samples(n),
        ..LineFilterConfig::new(sfreq)
    };
    let auto = LineFilterConfig {
        freqs: None,
        notch_widths: None,
        ..targeted.clone()
    };

    let (out_targeted, report_targeted) = line_filter(&data, &targeted).unwrap();
    let (out_auto, report_auto) = line_filter(&data, &auto).unwrap();

    assert_eq!(report_targeted.kind, ReportKind::Removed);
    assert_eq!(report_auto.kind, ReportKind::Detected);
    assert!(report_auto.windows_at(50.0) >= 1);

    let amp_targeted = amplitude_at(&out_targeted.row(0).to_vec(), sfreq, 50.0);
    let amp_auto = amplitude_at(&out_auto.row(0).to_vec(), sfreq, 50.0);
    assert!(amp_targeted < 0.1, "targeted residual {amp_targeted}");
    assert!(amp_auto < 0.1, "auto-detect residual {amp_auto}");
}

/// Epoched input replicates picks per epoch and leaves unpicked channels
/// byte-identical.
#[test]
fn epoched_data_respects_picks() {
    init_logging();
    let sfreq = 1000.0;
    let n = 500;
    let hum = sine(n, sfreq, 50.0, 1.0);
    let mut data = Array3::zeros((2, 2, n));
    for epoch in 0..2 {
        let noise = white_noise(n, 0.05, 50 + epoch as u64);
        for t in 0..n {
            data[[epoch, 0, t]] = hum[t] + noise[t];
            data[[epoch, 1, t]] = noise[t];
        }
    }

    let config = LineFilterConfig {
        freqs: Some(vec![50.0]),
        notch_widths: Some(NotchWidths::Scalar(10.0)),
        picks: Picks::Indices(vec![0]),
        n_jobs: Some(2),
        ..LineFilterConfig::new(sfreq)
    };
    let (filtered, report) = line_filter_epochs(&data, &config).unwrap();

    assert_eq!(filtered.dim(), data.dim());
    // one analysis window per epoch
    assert_eq!(report.windows_at(50.0), 2);
    for epoch in 0..2 {
        let picked_out: Vec<f64> = (0..n).map(|t| filtered[[epoch, 0, t]]).collect();
        assert!(amplitude_at(&picked_out, sfreq, 50.0) < 0.15);
        for t in 0..n {
            assert_eq!(filtered[[epoch, 1, t]], data[[epoch, 1, t]]);
        }
    }
}

#[test]
fn configuration_errors_reject_before_processing() {
    init_logging();
    let data = Array2::zeros((2, 1000));

    let mismatched = LineFilterConfig {
        freqs: Some(vec![60.0, 120.0]),
        notch_widths: Some(NotchWidths::PerFreq(vec![10.0])),
        ..LineFilterConfig::new(1000.0)
    };
    assert!(matches!(
        line_filter(&data, &mismatched),
        Err(NotchError::InvalidParameter(_))
    ));

    let negative_width = LineFilterConfig {
        freqs: Some(vec![60.0]),
        notch_widths: Some(NotchWidths::Scalar(-10.0)),
        ..LineFilterConfig::new(1000.0)
    };
    assert!(line_filter(&data, &negative_width).is_err());

    let bad_pick = LineFilterConfig {
        picks: Picks::Indices(vec![5]),
        ..LineFilterConfig::new(1000.0)
    };
    assert!(line_filter(&data, &bad_pick).is_err());

    let bad_p = LineFilterConfig {
        p_value: 1.5,
        ..LineFilterConfig::new(1000.0)
    };
    assert!(line_filter(&data, &bad_p).is_err());
}

/// A bandwidth too narrow for the window surfaces as a per-channel taper
/// design failure.
#[test]
fn unresolvable_bandwidth_fails_per_channel() {
    init_logging();
    let data = Array2::zeros((2, 1000)) + 1e-3;
    let config = LineFilterConfig {
        mt_bandwidth: Some(1.2),
        chunk_length: ChunkLength::Samples(1000),
        ..LineFilterConfig::new(1000.0)
    };
    let err = line_filter(&data, &config).unwrap_err();
    assert!(matches!(err, NotchError::Channel { .. }), "got {err}");
}

#[test]
fn report_round_trips_through_serde() {
    init_logging();
    let sfreq = 1000.0;
    let n = 1000;
    let mut data = Array2::zeros((1, n));
    let hum = sine(n, sfreq, 60.0, 1.0);
    let noise = white_noise(n, 0.05, 61);
    for t in 0..n {
        data[[0, t]] = hum[t] + noise[t];
    }
    let config = LineFilterConfig {
        freqs: Some(vec![60.0]),
        notch_widths: Some(NotchWidths::Scalar(10.0)),
        chunk_length: ChunkLength::Samples(n),
        ..LineFilterConfig::new(sfreq)
    };
    let (_, report) = line_filter(&data, &config).unwrap();

    let json = serde_json::to_string(&report).unwrap();
    let back: mtnotch::NoiseReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back, report);
    assert!(report.to_string().contains("Removed notch frequencies"));
}
