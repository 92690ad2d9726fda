//! Line-noise removal: per-chunk sinusoid subtraction, the per-channel
//! overlap-add pipeline, and the parallel channel dispatcher.
//!
//! Multitaper removal is inspired by the Chronux toolbox (www.chronux.org)
//! and "Observed Brain Dynamics" by Mitra & Bokil, Oxford University Press,
//! 2008.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;

use ndarray::{s, Array2, Array3};
use rayon::prelude::*;

use crate::cola::{ColaAccumulator, ColaPlan};
use crate::error::{NotchError, Result};
use crate::ftest::{restrict_to_targets, sine_f_test};
use crate::spectra::mt_spectra;
use crate::tapers::{TaperBank, TaperSet};
use crate::types::{FreqCount, LineFilterConfig, NoiseReport, ReportKind};

/// Shared, read-only state for one filtering invocation.
struct FilterContext {
    sfreq: f64,
    /// target frequencies paired with resolved notch widths; `None` means
    /// auto-detect mode
    targets: Option<(Vec<f64>, Vec<f64>)>,
    plan: ColaPlan,
    bank: TaperBank,
}

/// Cleaned samples plus the removed frequencies of each analysis window.
struct ChannelOutcome {
    samples: Vec<f64>,
    window_freqs: Vec<Vec<f64>>,
}

/// Subtract significant sinusoids from one chunk.
///
/// Returns the cleaned chunk and the (unrounded) removed frequencies. A
/// chunk with no significant bins passes through unmodified.
fn mt_remove(x: &[f64], ctx: &FilterContext, set: &TaperSet) -> (Vec<f64>, Vec<f64>) {
    let (spectra, freqs) = mt_spectra(x, &set.tapers, ctx.sfreq);
    let (f_stat, amplitude) = sine_f_test(&set.tapers, &spectra);

    let mut indices: Vec<usize> = f_stat
        .iter()
        .enumerate()
        .filter(|&(_, &f)| f > set.threshold)
        .map(|(i, _)| i)
        .collect();
    if let Some((targets, widths)) = &ctx.targets {
        restrict_to_targets(&mut indices, &freqs, targets, widths);
    }
    if indices.is_empty() {
        return (x.to_vec(), Vec::new());
    }

    // sum the fitted sinusoids on the chunk's own time vector, subtract once
    let mut fit = vec![0.0; x.len()];
    for &i in &indices {
        let c = amplitude[i] * 2.0;
        let (amp, phase) = (c.norm(), c.arg());
        let omega = 2.0 * PI * freqs[i];
        for (t, value) in fit.iter_mut().enumerate() {
            *value += amp * (omega * t as f64 / ctx.sfreq + phase).cos();
        }
    }
    let cleaned = x.iter().zip(&fit).map(|(&v, &f)| v - f).collect();
    let removed = indices.into_iter().map(|i| freqs[i]).collect();
    (cleaned, removed)
}

/// Run the chunked removal pipeline over one channel.
fn filter_channel(x: &[f64], ctx: &FilterContext) -> Result<ChannelOutcome> {
    let mut acc = ColaAccumulator::new(x.len());
    let mut window_freqs = Vec::with_capacity(ctx.plan.chunks().len());
    for chunk in ctx.plan.chunks() {
        let segment = &x[chunk.start..chunk.end()];
        // the clipped final chunk gets tapers for its exact length
        let set = ctx.bank.get(segment.len())?;
        let (mut cleaned, removed) = mt_remove(segment, ctx, &set);
        for (value, &w) in cleaned.iter_mut().zip(&chunk.weight) {
            *value *= w;
        }
        acc.push(chunk.start, &cleaned)?;
        window_freqs.push(removed);
    }
    Ok(ChannelOutcome {
        samples: acc.finish()?,
        window_freqs,
    })
}

fn check_finite<'a>(values: impl Iterator<Item = &'a f64>) -> Result<()> {
    for (i, value) in values.enumerate() {
        if !value.is_finite() {
            return Err(NotchError::InvalidInput(format!(
                "data to be notch filtered must be finite 64-bit floats, found {value} at flat index {i}; \
                 extract a clean raw buffer before filtering"
            )));
        }
    }
    Ok(())
}

fn build_context(config: &LineFilterConfig, n_times: usize) -> Result<FilterContext> {
    let chunk_samples = config.chunk_length.to_samples(config.sfreq, n_times)?;
    let plan = ColaPlan::new(n_times, chunk_samples)?;
    let targets = config.freqs.clone().zip(config.resolved_notch_widths()?);
    let bank = TaperBank::new(
        config.sfreq,
        config.mt_bandwidth,
        config.low_bias,
        config.adaptive,
        config.p_value,
    );
    Ok(FilterContext {
        sfreq: config.sfreq,
        targets,
        plan,
        bank,
    })
}

fn with_pool<R: Send>(n_jobs: Option<usize>, run: impl FnOnce() -> R + Send) -> Result<R> {
    match n_jobs {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| {
                    NotchError::InvalidParameter(format!("failed to build worker pool: {e}"))
                })?;
            Ok(pool.install(run))
        }
        None => Ok(run()),
    }
}

/// Merge per-window removal lists into 1 Hz bins counted across windows.
fn build_report(kind: ReportKind, window_freqs: &[Vec<f64>]) -> NoiseReport {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for window in window_freqs {
        let bins: BTreeSet<i64> = window.iter().map(|f| f.round() as i64).collect();
        for bin in bins {
            *counts.entry(bin).or_insert(0) += 1;
        }
    }
    NoiseReport {
        kind,
        entries: counts
            .into_iter()
            .map(|(bin, windows)| FreqCount {
                frequency: bin as f64,
                windows,
            })
            .collect(),
    }
}

/// One unit of parallel work: a channel (with its epoch for 3-D input).
struct Job {
    epoch: usize,
    channel: usize,
    samples: Vec<f64>,
}

/// Dispatch jobs across the worker pool and gather per-job results in input
/// order. Channels are independent; any completion order is fine.
fn run_jobs(
    jobs: Vec<Job>,
    ctx: &FilterContext,
    config: &LineFilterConfig,
) -> Result<(Vec<(usize, usize, ChannelOutcome)>, Option<NotchError>)> {
    let gathered: Vec<(usize, usize, Result<ChannelOutcome>)> = with_pool(config.n_jobs, || {
        jobs.into_par_iter()
            .map(|job| {
                log::debug!("processing epoch {} channel {}", job.epoch, job.channel);
                let outcome = filter_channel(&job.samples, ctx);
                (job.epoch, job.channel, outcome)
            })
            .collect()
    })?;

    let mut done = Vec::with_capacity(gathered.len());
    let mut first_error: Option<NotchError> = None;
    for (epoch, channel, outcome) in gathered {
        match outcome {
            Ok(outcome) => done.push((epoch, channel, outcome)),
            Err(e) => {
                let wrapped = NotchError::for_channel(channel, e);
                if config.fail_fast {
                    return Err(wrapped);
                }
                log::warn!("{wrapped}");
                if first_error.is_none() {
                    first_error = Some(wrapped);
                }
            }
        }
    }
    Ok((done, first_error))
}

fn report_kind(config: &LineFilterConfig) -> ReportKind {
    if config.freqs.is_none() {
        ReportKind::Detected
    } else {
        ReportKind::Removed
    }
}

/// Apply the multitaper line-noise notch filter to `(channels, samples)`
/// data, returning a filtered copy and the removal report.
///
/// Uses the sine F-test to find significant sinusoidal components per
/// overlapping analysis window and subtracts the fitted sinusoids. With
/// `freqs: None` the filter runs in auto-detect mode and reports every
/// detected component; with explicit targets only bins inside the notch
/// bands are removed.
pub fn line_filter(
    data: &Array2<f64>,
    config: &LineFilterConfig,
) -> Result<(Array2<f64>, NoiseReport)> {
    let mut out = data.clone();
    let report = line_filter_inplace(&mut out, config)?;
    Ok((out, report))
}

/// In-place variant of [`line_filter`]. On a per-channel failure without
/// `fail_fast`, successfully filtered channels keep their results and the
/// failed channel's samples are left untouched.
pub fn line_filter_inplace(
    data: &mut Array2<f64>,
    config: &LineFilterConfig,
) -> Result<NoiseReport> {
    config.validate()?;
    check_finite(data.iter())?;
    let (n_channels, n_times) = data.dim();
    let picks = config.picks.to_indices(n_channels)?;
    let ctx = build_context(config, n_times)?;

    log::info!(
        "notch filtering {} of {} channel(s) at {} Hz ({} window(s) of {} sample(s))",
        picks.len(),
        n_channels,
        config.sfreq,
        ctx.plan.chunks().len(),
        ctx.plan.chunks().first().map(|c| c.len()).unwrap_or(0),
    );

    let shared: &Array2<f64> = data;
    let jobs: Vec<Job> = picks
        .iter()
        .map(|&channel| Job {
            epoch: 0,
            channel,
            samples: shared.row(channel).to_vec(),
        })
        .collect();
    let (done, deferred) = run_jobs(jobs, &ctx, config)?;

    let mut window_freqs = Vec::new();
    for (_, channel, outcome) in done {
        data.row_mut(channel)
            .assign(&ndarray::aview1(&outcome.samples));
        window_freqs.extend(outcome.window_freqs);
    }
    if let Some(e) = deferred {
        // successful channels are already in place; the failed ones kept
        // their input samples
        return Err(e);
    }

    let report = build_report(report_kind(config), &window_freqs);
    log::info!("{report}");
    Ok(report)
}

/// Apply the filter to epoched `(epochs, channels, samples)` data; picks are
/// replicated per epoch. Data with more than three dimensions is not
/// supported by construction of the input type.
pub fn line_filter_epochs(
    data: &Array3<f64>,
    config: &LineFilterConfig,
) -> Result<(Array3<f64>, NoiseReport)> {
    let mut out = data.clone();
    let report = line_filter_epochs_inplace(&mut out, config)?;
    Ok((out, report))
}

/// In-place variant of [`line_filter_epochs`].
pub fn line_filter_epochs_inplace(
    data: &mut Array3<f64>,
    config: &LineFilterConfig,
) -> Result<NoiseReport> {
    config.validate()?;
    check_finite(data.iter())?;
    let (n_epochs, n_channels, n_times) = data.dim();
    let picks = config.picks.to_indices(n_channels)?;
    let ctx = build_context(config, n_times)?;

    log::info!(
        "notch filtering {} of {} channel(s) across {} epoch(s)",
        picks.len(),
        n_channels,
        n_epochs,
    );

    let shared: &Array3<f64> = data;
    let jobs: Vec<Job> = (0..n_epochs)
        .flat_map(|epoch| picks.iter().map(move |&channel| (epoch, channel)))
        .map(|(epoch, channel)| Job {
            epoch,
            channel,
            samples: shared.slice(s![epoch, channel, ..]).to_vec(),
        })
        .collect();
    let (done, deferred) = run_jobs(jobs, &ctx, config)?;

    let mut window_freqs = Vec::new();
    for (epoch, channel, outcome) in done {
        data.slice_mut(s![epoch, channel, ..])
            .assign(&ndarray::aview1(&outcome.samples));
        window_freqs.extend(outcome.window_freqs);
    }
    if let Some(e) = deferred {
        return Err(e);
    }

    let report = build_report(report_kind(config), &window_freqs);
    log::info!("{report}");
    Ok(report)
}
