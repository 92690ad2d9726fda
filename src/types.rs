//! Configuration and report types for the line-noise filter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NotchError, Result};

/// Length of the overlap-add analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkLength {
    /// Window length as a duration in seconds.
    Seconds(f64),
    /// Window length as a raw sample count.
    Samples(usize),
}

impl Default for ChunkLength {
    fn default() -> Self {
        ChunkLength::Seconds(10.0)
    }
}

impl ChunkLength {
    /// Convert to a sample count for the given sampling rate, clipped to the
    /// signal length.
    pub fn to_samples(&self, sfreq: f64, n_times: usize) -> Result<usize> {
        let samples = match *self {
            ChunkLength::Seconds(secs) => {
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(NotchError::InvalidParameter(format!(
                        "chunk length must be a positive duration, got {secs} s"
                    )));
                }
                (secs * sfreq).round() as usize
            }
            ChunkLength::Samples(samples) => samples,
        };
        if samples == 0 {
            return Err(NotchError::InvalidParameter(
                "chunk length resolves to 0 samples".into(),
            ));
        }
        Ok(samples.min(n_times))
    }
}

impl FromStr for ChunkLength {
    type Err = NotchError;

    /// Parse a human-readable window length: `"10s"`, `"700ms"`, or a bare
    /// sample count such as `"4096"`.
    fn from_str(s: &str) -> Result<Self> {
        let parse_err = || {
            NotchError::InvalidParameter(format!(
                "cannot parse chunk length {s:?}; use e.g. \"10s\", \"700ms\", or a sample count"
            ))
        };
        let t = s.trim();
        if let Some(ms) = t.strip_suffix("ms") {
            let v: f64 = ms.trim().parse().map_err(|_| parse_err())?;
            Ok(ChunkLength::Seconds(v / 1000.0))
        } else if let Some(secs) = t.strip_suffix('s') {
            let v: f64 = secs.trim().parse().map_err(|_| parse_err())?;
            Ok(ChunkLength::Seconds(v))
        } else {
            let v: usize = t.parse().map_err(|_| parse_err())?;
            Ok(ChunkLength::Samples(v))
        }
    }
}

/// Channel selection for filtering.
///
/// Channel-type taxonomies live outside the engine; callers pass a plain
/// index list or boolean mask instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Picks {
    /// Filter every channel.
    All,
    /// Filter the channels at these indices (0-based).
    Indices(Vec<usize>),
    /// Filter channels where the mask is true; must match the channel count.
    Mask(Vec<bool>),
}

impl Default for Picks {
    fn default() -> Self {
        Picks::All
    }
}

impl Picks {
    /// Expand to a deduplicated list of channel indices.
    pub fn to_indices(&self, n_channels: usize) -> Result<Vec<usize>> {
        match self {
            Picks::All => Ok((0..n_channels).collect()),
            Picks::Indices(indices) => {
                let mut seen = vec![false; n_channels];
                let mut out = Vec::with_capacity(indices.len());
                for &idx in indices {
                    if idx >= n_channels {
                        return Err(NotchError::InvalidParameter(format!(
                            "pick index {idx} is out of range for {n_channels} channels"
                        )));
                    }
                    if !seen[idx] {
                        seen[idx] = true;
                        out.push(idx);
                    }
                }
                Ok(out)
            }
            Picks::Mask(mask) => {
                if mask.len() != n_channels {
                    return Err(NotchError::InvalidParameter(format!(
                        "pick mask has {} entries but the data has {n_channels} channels",
                        mask.len()
                    )));
                }
                Ok(mask
                    .iter()
                    .enumerate()
                    .filter(|(_, &m)| m)
                    .map(|(i, _)| i)
                    .collect())
            }
        }
    }
}

/// Stop-band widths around the target frequencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotchWidths {
    /// One width broadcast across all target frequencies.
    Scalar(f64),
    /// One width per target frequency; lengths must match.
    PerFreq(Vec<f64>),
}

/// Configuration for [`line_filter`](crate::filter::line_filter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineFilterConfig {
    /// Sampling rate of the data (Hz).
    pub sfreq: f64,

    /// Frequencies to notch filter in Hz, e.g. `[60.0, 120.0, 180.0]`.
    /// `None` runs the F-test in auto-detect mode: every bin that crosses the
    /// threshold is treated as a line-noise candidate.
    #[serde(default)]
    pub freqs: Option<Vec<f64>>,

    /// Width of the stop band centred at each target frequency (Hz).
    /// Defaults to `freq / 200` per target when targets are given.
    #[serde(default)]
    pub notch_widths: Option<NotchWidths>,

    /// Length of the overlap-add analysis window; clipped to the signal.
    #[serde(default)]
    pub chunk_length: ChunkLength,

    /// Half-bandwidth of the multitaper windowing functions in Hz. The
    /// default picks a time half-bandwidth product of 4.
    #[serde(default)]
    pub mt_bandwidth: Option<f64>,

    /// P-value for the sine F-test threshold. Bonferroni corrected for the
    /// number of frequency bins, so large values may be justified.
    #[serde(default = "default_p_value")]
    pub p_value: f64,

    /// Channels to filter; everything else passes through untouched.
    #[serde(default)]
    pub picks: Picks,

    /// Use adaptive weights when combining tapered spectra (requires at
    /// least 3 tapers; demoted with a warning otherwise).
    #[serde(default = "default_true")]
    pub adaptive: bool,

    /// Only keep tapers with more than 90% spectral concentration within
    /// the bandwidth.
    #[serde(default = "default_true")]
    pub low_bias: bool,

    /// Worker pool size; `None` uses the global rayon pool.
    #[serde(default)]
    pub n_jobs: Option<usize>,

    /// Abort on the first failed channel instead of finishing the batch.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_p_value() -> f64 {
    0.05
}

fn default_true() -> bool {
    true
}

impl Default for LineFilterConfig {
    fn default() -> Self {
        Self::new(256.0)
    }
}

impl LineFilterConfig {
    pub fn new(sfreq: f64) -> Self {
        Self {
            sfreq,
            freqs: None,
            notch_widths: None,
            chunk_length: ChunkLength::default(),
            mt_bandwidth: None,
            p_value: default_p_value(),
            picks: Picks::default(),
            adaptive: true,
            low_bias: true,
            n_jobs: None,
            fail_fast: false,
        }
    }

    /// Validate scalar parameters. Runs before any channel processing.
    pub fn validate(&self) -> Result<()> {
        if !self.sfreq.is_finite() || self.sfreq <= 0.0 {
            return Err(NotchError::InvalidParameter(format!(
                "sampling rate must be positive, got {}",
                self.sfreq
            )));
        }
        if !self.p_value.is_finite() || self.p_value <= 0.0 || self.p_value >= 1.0 {
            return Err(NotchError::InvalidParameter(format!(
                "p_value must lie in (0, 1), got {}",
                self.p_value
            )));
        }
        if let Some(bw) = self.mt_bandwidth {
            if !bw.is_finite() || bw < 0.0 {
                return Err(NotchError::InvalidParameter(format!(
                    "mt_bandwidth must be >= 0 Hz, got {bw}"
                )));
            }
        }
        if let Some(freqs) = &self.freqs {
            if freqs.iter().any(|f| !f.is_finite()) {
                return Err(NotchError::InvalidParameter(
                    "target frequencies must be finite".into(),
                ));
            }
        }
        if self.n_jobs == Some(0) {
            return Err(NotchError::InvalidParameter(
                "n_jobs must be at least 1".into(),
            ));
        }
        self.resolved_notch_widths().map(|_| ())
    }

    /// Resolve notch widths against the target frequencies: broadcast a
    /// scalar, check list lengths, and apply the `freq / 200` default.
    pub(crate) fn resolved_notch_widths(&self) -> Result<Option<Vec<f64>>> {
        let freqs = match &self.freqs {
            Some(freqs) => freqs,
            None => return Ok(None),
        };
        let widths = match &self.notch_widths {
            None => freqs.iter().map(|f| f / 200.0).collect(),
            Some(NotchWidths::Scalar(w)) => {
                if !w.is_finite() || *w < 0.0 {
                    return Err(NotchError::InvalidParameter(format!(
                        "notch_widths must be >= 0, got {w}"
                    )));
                }
                vec![*w; freqs.len()]
            }
            Some(NotchWidths::PerFreq(widths)) => {
                if widths.len() != freqs.len() {
                    return Err(NotchError::InvalidParameter(format!(
                        "notch_widths must be a scalar or match the {} target frequencies, got {} widths",
                        freqs.len(),
                        widths.len()
                    )));
                }
                if widths.iter().any(|w| !w.is_finite() || *w < 0.0) {
                    return Err(NotchError::InvalidParameter(
                        "notch_widths must be >= 0".into(),
                    ));
                }
                widths.clone()
            }
        };
        Ok(Some(widths))
    }
}

/// Framing of the removal report: targeted runs remove, auto-detect runs
/// detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Detected,
    Removed,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Detected => write!(f, "Detected"),
            ReportKind::Removed => write!(f, "Removed"),
        }
    }
}

/// One 1 Hz report bin: a frequency and the number of analysis windows in
/// which it was removed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreqCount {
    pub frequency: f64,
    pub windows: usize,
}

/// Aggregated removal report across all channels and windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseReport {
    pub kind: ReportKind,
    /// 1 Hz-binned counts, sorted by frequency ascending.
    pub entries: Vec<FreqCount>,
}

impl NoiseReport {
    /// Look up the window count for a 1 Hz bin.
    pub fn windows_at(&self, frequency: f64) -> usize {
        self.entries
            .iter()
            .find(|e| e.frequency == frequency)
            .map(|e| e.windows)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for NoiseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} notch frequencies (Hz):", self.kind)?;
        if self.entries.is_empty() {
            return write!(f, "    None");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "    {:6.2} : {:4} window{}",
                entry.frequency,
                entry.windows,
                if entry.windows == 1 { "" } else { "s" }
            )?;
        }
        Ok(())
    }
}
