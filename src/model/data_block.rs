//! One averaged measurement of one channel.

use num_complex::Complex;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::dsp;
use crate::error::{ReadoutError, Result};

/// Taps of the default statistics filter.
pub const DEFAULT_FILTER_LENGTH: usize = 256;

/// Optional environmental readings recorded with a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentTags {
    /// Millimeter-wave source frequency.
    pub mmw_source_freq: f64,
    /// Millimeter-wave source modulation frequency.
    pub mmw_source_modulation_freq: f64,
    /// Zero-bias detector power in dBm.
    pub zbd_power_dbm: f64,
    /// Zero-bias detector voltage.
    pub zbd_voltage: f64,
}

/// Everything about a block except its samples.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    /// Tone-table index of the tone that produced the samples.
    pub tone: usize,
    /// FFT bin the samples were read from.
    pub fft_bin: usize,
    /// Length of the DAC tone table.
    pub tone_table_size: usize,
    /// FFT size of the channelizer.
    pub nfft: usize,
    /// Scale factor from raw samples to calibrated units.
    pub wave_norm: f64,
    /// Capture start, seconds since the UNIX epoch.
    pub t0: f64,
    /// ADC sampling frequency in MHz.
    pub sample_rate: f64,
    /// Offset step that produced the block; `None` for time-stream captures.
    pub sweep_index: Option<usize>,
    /// Position of the channel in the padded tone list.
    pub channel_id: usize,
    /// Environmental readings, when recorded.
    pub tags: Option<EnvironmentTags>,
}

impl BlockMeta {
    /// Measured frequency in MHz: `sample_rate * tone / tone_table_size`.
    pub fn frequency(&self) -> f64 {
        self.sample_rate * self.tone as f64 / self.tone_table_size as f64
    }

    /// Time between consecutive samples of one FFT bin, in microseconds.
    pub fn dt(&self) -> f64 {
        self.nfft as f64 / self.sample_rate
    }
}

/// Filtered statistics of a block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStats {
    /// Low-pass filtered, normalization-scaled complex mean (the S21 estimate).
    pub mean: Complex<f64>,
    /// Standard deviation of the unfiltered, normalization-scaled samples.
    pub std: f64,
    /// Samples that entered the statistics (after the warm-up was dropped).
    pub samples: usize,
}

impl BlockStats {
    fn degenerate() -> Self {
        Self {
            mean: Complex::new(f64::NAN, f64::NAN),
            std: f64::NAN,
            samples: 0,
        }
    }

    /// True when there were no samples past the filter warm-up.
    pub fn is_degenerate(&self) -> bool {
        self.samples == 0
    }
}

/// Capture of one averaged measurement at one (channel, offset).
///
/// Immutable once built. `mean()` and `std()` share one statistics pass that runs at most
/// once; the result is frozen in a `OnceCell` and safe to read from several threads.
#[derive(Debug, Clone)]
pub struct DataBlock {
    samples: Vec<Complex<f64>>,
    meta: BlockMeta,
    filter_length: usize,
    stats: OnceCell<BlockStats>,
}

impl DataBlock {
    /// Build a block with the default 256-tap statistics filter.
    pub fn new(samples: Vec<Complex<f64>>, meta: BlockMeta) -> Self {
        Self::with_filter_length(samples, meta, DEFAULT_FILTER_LENGTH)
    }

    /// Build a block with a custom statistics filter length.
    pub fn with_filter_length(
        samples: Vec<Complex<f64>>,
        meta: BlockMeta,
        filter_length: usize,
    ) -> Self {
        Self {
            samples,
            meta,
            filter_length,
            stats: OnceCell::new(),
        }
    }

    /// Raw samples as captured.
    pub fn samples(&self) -> &[Complex<f64>] {
        &self.samples
    }

    /// Block metadata.
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Measured frequency in MHz.
    pub fn frequency(&self) -> f64 {
        self.meta.frequency()
    }

    /// Filter length used for the statistics.
    pub fn filter_length(&self) -> usize {
        self.filter_length
    }

    /// True once the statistics have been computed.
    pub fn is_computed(&self) -> bool {
        self.stats.get().is_some()
    }

    /// Filtered statistics, computed on first use.
    pub fn stats(&self) -> &BlockStats {
        self.stats.get_or_init(|| self.compute())
    }

    /// Statistics, or a shape error when the block is shorter than the filter warm-up.
    pub fn checked_stats(&self) -> Result<&BlockStats> {
        let stats = self.stats();
        if stats.is_degenerate() {
            return Err(ReadoutError::shape(format!(
                "{} samples do not cover the {}-tap filter warm-up",
                self.samples.len(),
                self.filter_length
            )));
        }
        Ok(stats)
    }

    /// S21 estimate: filtered, normalization-scaled mean.
    pub fn mean(&self) -> Complex<f64> {
        self.stats().mean
    }

    /// Standard deviation of the unfiltered, normalization-scaled samples.
    pub fn std(&self) -> f64 {
        self.stats().std
    }

    fn compute(&self) -> BlockStats {
        let warmup = self.filter_length;
        if self.samples.len() <= warmup {
            return BlockStats::degenerate();
        }
        let norm = self.meta.wave_norm;
        let taps = dsp::lowpass_taps(warmup, 1.0 / warmup.max(1) as f64);
        let filtered = dsp::fft_filter(&taps, &self.samples);

        let kept = &filtered[warmup..];
        let count = kept.len() as f64;
        let mean = kept.iter().sum::<Complex<f64>>() / count * norm;

        let raw = &self.samples[warmup..];
        let raw_mean = raw.iter().sum::<Complex<f64>>() / count;
        let variance = raw
            .iter()
            .map(|s| (s - raw_mean).norm_sqr())
            .sum::<f64>()
            / count;

        BlockStats {
            mean,
            std: variance.sqrt() * norm.abs(),
            samples: kept.len(),
        }
    }
}
