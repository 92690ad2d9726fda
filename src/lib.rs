//! Multitaper power-line noise removal for multichannel electrophysiology.
//!
//! The filter splits each channel into overlapping analysis windows,
//! estimates multitaper (DPSS) spectra per window, finds significant
//! sinusoidal components with the sine F-test, subtracts the fitted
//! sinusoids, and rejoins the windows by constant overlap-add. Channels are
//! processed independently across a rayon worker pool.
//!
//! ```
//! use mtnotch::{line_filter, ChunkLength, LineFilterConfig, NotchWidths};
//! use ndarray::Array2;
//!
//! let sfreq = 1000.0;
//! // two channels of mains hum
//! let data = Array2::from_shape_fn((2, 1000), |(_, t)| {
//!     (2.0 * std::f64::consts::PI * 60.0 * t as f64 / sfreq).sin()
//! });
//! let config = LineFilterConfig {
//!     freqs: Some(vec![60.0]),
//!     notch_widths: Some(NotchWidths::Scalar(10.0)),
//!     chunk_length: ChunkLength::Samples(1000),
//!     ..LineFilterConfig::new(sfreq)
//! };
//! let (filtered, report) = line_filter(&data, &config)?;
//! assert_eq!(filtered.dim(), data.dim());
//! assert!(report.windows_at(60.0) > 0);
//! # Ok::<(), mtnotch::NotchError>(())
//! ```

pub mod cola;
pub mod error;
pub mod filter;
pub mod ftest;
pub mod spectra;
pub mod tapers;
pub mod types;

pub use error::{NotchError, Result};
pub use filter::{
    line_filter, line_filter_epochs, line_filter_epochs_inplace, line_filter_inplace,
};
pub use tapers::{dpss_windows, TaperBank, TaperSet};
pub use types::{
    ChunkLength, FreqCount, LineFilterConfig, NoiseReport, NotchWidths, Picks, ReportKind,
};
