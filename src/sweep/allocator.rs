//! Tone/channel frequency allocation.
//!
//! Maps target frequencies to DAC tone-table indices and channelizer FFT bins, and splits
//! the channels into batches that fit the per-read bin capacity.
//!
//! Batches are strided: with `nsets` batches, batch `i` holds channels `i, i + nsets,
//! i + 2 * nsets, ...` of the sorted tone list, so tones read together sit far apart in
//! frequency. The tone list is padded to a multiple of the capacity with placeholder
//! tones above the highest real tone; their blocks are discarded after acquisition.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::f64::consts::TAU;
use tracing::{debug, warn};

use crate::error::{ReadoutError, Result};

/// One synthesized tone driving one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Tone {
    /// Position in the padded, sorted tone list (the channel id).
    pub channel_id: usize,
    /// Requested frequency in MHz, before tone-table quantization.
    pub target_frequency: f64,
    /// Index into the DAC tone table.
    pub tone_index: usize,
    /// Channelizer bin the tone is read from.
    pub fft_bin: usize,
    /// Relative amplitude.
    pub amplitude: f64,
    /// Phase offset in radians.
    pub phase: f64,
    /// Padding tone with no resonator behind it.
    pub placeholder: bool,
}

/// The active set of tones loaded into waveform memory at one offset.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneBank {
    /// Tones by channel id.
    pub tones: Vec<Tone>,
    /// Offset applied to every target frequency, in MHz.
    pub offset: f64,
    /// ADC sampling frequency in MHz.
    pub sample_rate_mhz: f64,
    /// Length of the DAC tone table.
    pub tone_table_size: usize,
}

impl ToneBank {
    /// Quantized frequency of a tone in MHz.
    pub fn frequency(&self, tone: &Tone) -> f64 {
        self.sample_rate_mhz * tone.tone_index as f64 / self.tone_table_size as f64
    }

    /// Tone-table indices, by channel id.
    pub fn tone_indexes(&self) -> Vec<usize> {
        self.tones.iter().map(|t| t.tone_index).collect()
    }

    /// FFT bins, by channel id.
    pub fn fft_bins(&self) -> Vec<usize> {
        self.tones.iter().map(|t| t.fft_bin).collect()
    }
}

/// Channel partition of a padded tone list.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Sorted, padded center frequencies in MHz.
    pub centers: Vec<f64>,
    /// Number of real (non-placeholder) channels; they occupy ids `0..real_channels`.
    pub real_channels: usize,
    /// Channel ids read together, one entry per batch.
    pub batches: Vec<Vec<usize>>,
}

impl Allocation {
    /// True when the channel id is a padding tone.
    pub fn is_placeholder(&self, channel_id: usize) -> bool {
        channel_id >= self.real_channels
    }

    /// Total channel count including placeholders.
    pub fn channels(&self) -> usize {
        self.centers.len()
    }
}

/// Maps frequencies to tone-table indices and FFT bins.
#[derive(Debug, Clone)]
pub struct ToneAllocator {
    sample_rate_mhz: f64,
    tone_table_size: usize,
    nfft: usize,
    channels_per_read: usize,
    phase_seed: u64,
}

impl ToneAllocator {
    /// Create an allocator for a board geometry.
    pub fn new(
        sample_rate_mhz: f64,
        tone_table_size: usize,
        nfft: usize,
        channels_per_read: usize,
    ) -> Result<Self> {
        if sample_rate_mhz.is_nan() || sample_rate_mhz <= 0.0 {
            return Err(ReadoutError::Validation(format!(
                "sample rate must be positive, got {sample_rate_mhz}"
            )));
        }
        if nfft == 0 || tone_table_size < nfft {
            return Err(ReadoutError::Validation(format!(
                "tone table ({tone_table_size}) must be at least the FFT size ({nfft})"
            )));
        }
        if channels_per_read == 0 {
            return Err(ReadoutError::Validation(
                "channels_per_read must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            sample_rate_mhz,
            tone_table_size,
            nfft,
            channels_per_read,
            phase_seed: 0,
        })
    }

    /// Seed of the tone phase generator. Phases depend only on the seed and channel id.
    pub fn with_phase_seed(mut self, seed: u64) -> Self {
        self.phase_seed = seed;
        self
    }

    /// Bin capacity of one read.
    pub fn channels_per_read(&self) -> usize {
        self.channels_per_read
    }

    /// ADC sampling frequency in MHz.
    pub fn sample_rate_mhz(&self) -> f64 {
        self.sample_rate_mhz
    }

    /// Length of the DAC tone table.
    pub fn tone_table_size(&self) -> usize {
        self.tone_table_size
    }

    /// FFT size of the channelizer.
    pub fn nfft(&self) -> usize {
        self.nfft
    }

    /// Nearest tone-table index of a frequency in `[0, sample_rate)`.
    pub fn tone_index(&self, freq: f64) -> Result<usize> {
        if !(0.0..self.sample_rate_mhz).contains(&freq) {
            return Err(ReadoutError::Validation(format!(
                "tone frequency {freq} MHz outside [0, {}) MHz",
                self.sample_rate_mhz
            )));
        }
        let index = (freq * self.tone_table_size as f64 / self.sample_rate_mhz).round() as usize;
        Ok(index % self.tone_table_size)
    }

    /// FFT bin containing a tone-table index.
    pub fn fft_bin(&self, tone_index: usize) -> usize {
        let bin = (tone_index as f64 * self.nfft as f64 / self.tone_table_size as f64).round();
        bin as usize % self.nfft
    }

    /// Sort the targets and pad them to a multiple of the bin capacity.
    ///
    /// Padding tones sit at `max + 1, max + 2, ...` MHz.
    pub fn pad(&self, targets: &[f64]) -> Vec<f64> {
        let mut centers = targets.to_vec();
        centers.sort_by(f64::total_cmp);
        let remainder = centers.len() % self.channels_per_read;
        if remainder > 0 {
            let max = centers.last().copied().unwrap_or(0.0);
            let missing = self.channels_per_read - remainder;
            debug!(missing, "padding tone list with placeholder tones");
            centers.extend((1..=missing).map(|k| max + k as f64));
        }
        centers
    }

    /// Sort, pad and batch target frequencies.
    ///
    /// `offsets` are the sweep steps the batches must stay collision-free for; pass `&[0.0]`
    /// for a single tone set.
    ///
    /// Bins grow monotonically with frequency, so two channels of one strided batch can only
    /// share a bin if all `nsets + 1` channels between them do, and no other partition into
    /// `nsets` batches separates them. Such a plan is rejected with
    /// [`ReadoutError::BinCollision`].
    pub fn allocate(&self, targets: &[f64], offsets: &[f64]) -> Result<Allocation> {
        if targets.is_empty() {
            return Err(ReadoutError::Validation("no target frequencies".to_string()));
        }
        let centers = self.pad(targets);
        let nsets = centers.len() / self.channels_per_read;

        // bins of every channel at every offset
        let mut bins: Vec<Vec<usize>> = Vec::with_capacity(centers.len());
        for center in &centers {
            let mut per_offset = Vec::with_capacity(offsets.len());
            for offset in offsets {
                per_offset.push(self.fft_bin(self.tone_index(center + offset)?));
            }
            bins.push(per_offset);
        }

        let batches: Vec<Vec<usize>> = (0..nsets)
            .map(|set| (set..centers.len()).step_by(nsets).collect())
            .collect();
        for (batch, channels) in batches.iter().enumerate() {
            if let Some(bin) = first_collision(channels, &bins) {
                warn!(batch, bin, "tones read together share an FFT bin");
                return Err(ReadoutError::BinCollision { batch, bin });
            }
        }

        debug!(
            channels = centers.len(),
            real = targets.len(),
            batches = batches.len(),
            "allocated channel batches"
        );
        Ok(Allocation {
            centers,
            real_channels: targets.len(),
            batches,
        })
    }

    /// Tone bank of an allocation shifted by `offset` MHz.
    pub fn bank(&self, allocation: &Allocation, offset: f64) -> Result<ToneBank> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.phase_seed);
        let tones = allocation
            .centers
            .iter()
            .enumerate()
            .map(|(channel_id, center)| {
                let target_frequency = center + offset;
                let tone_index = self.tone_index(target_frequency)?;
                Ok(Tone {
                    channel_id,
                    target_frequency,
                    tone_index,
                    fft_bin: self.fft_bin(tone_index),
                    amplitude: 1.0,
                    phase: rng.gen_range(0.0..TAU),
                    placeholder: allocation.is_placeholder(channel_id),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ToneBank {
            tones,
            offset,
            sample_rate_mhz: self.sample_rate_mhz,
            tone_table_size: self.tone_table_size,
        })
    }

    /// Allocate and build one tone bank per offset.
    pub fn plan(&self, targets: &[f64], offsets: &[f64]) -> Result<SweepPlan> {
        if offsets.is_empty() {
            return Err(ReadoutError::Validation("no sweep offsets".to_string()));
        }
        let allocation = self.allocate(targets, offsets)?;
        let banks = offsets
            .iter()
            .map(|offset| self.bank(&allocation, *offset))
            .collect::<Result<Vec<_>>>()?;
        Ok(SweepPlan {
            allocation,
            offsets: offsets.to_vec(),
            banks,
        })
    }
}

/// First bin used twice inside one batch, at any offset.
fn first_collision(batch: &[usize], bins: &[Vec<usize>]) -> Option<usize> {
    let steps = bins.first().map_or(0, Vec::len);
    for step in 0..steps {
        let mut seen = HashSet::with_capacity(batch.len());
        for channel in batch {
            if !seen.insert(bins[*channel][step]) {
                return Some(bins[*channel][step]);
            }
        }
    }
    None
}

/// Everything the sequencer needs to run one sweep.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Channel partition.
    pub allocation: Allocation,
    /// Frequency offsets in MHz; the sweep index of a step is its position here.
    pub offsets: Vec<f64>,
    /// One tone bank per offset.
    pub banks: Vec<ToneBank>,
}

impl SweepPlan {
    /// Number of offset steps.
    pub fn steps(&self) -> usize {
        self.offsets.len()
    }

    /// Quantized frequencies of every (offset, channel), offset-major.
    pub fn measured_frequencies(&self) -> Vec<Vec<f64>> {
        self.banks
            .iter()
            .map(|bank| bank.tones.iter().map(|t| bank.frequency(t)).collect())
            .collect()
    }
}

/// Evenly spaced offsets from `start` to `stop` inclusive, in MHz.
pub fn linear_offsets(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}
