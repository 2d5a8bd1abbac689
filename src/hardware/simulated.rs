//! Simulated readout
//!
//! A [`ReadoutDevice`] backed by a resonator model instead of a board. Each loaded tone
//! sees the transmission of every configured resonator:
//!
//! ```text
//! S21(f) = 1 - sum_r depth_r / (1 + 2j * Q_r * (f - f0_r) / f0_r)
//! ```
//!
//! Samples of a selected bin are `S21 / wave_norm` plus uniform noise, so calibrated block
//! means recover S21. Samples of the selected bins are interleaved in selection order and
//! cut into frames whose address counters advance by one swap per frame.
//!
//! # Fault injection
//!
//! - `fail_reads(&[n, ...])` - the listed read calls (0-based) fail with a hardware error
//!   after delivering half the frames
//! - `stall_reads(&[n, ...])` - the listed read calls time out after half the frames
//! - `lose_swaps(&[n, ...])` - the listed read calls skip two buffer swaps halfway and
//!   report the gap on an otherwise successful capture
//! - `with_failure_rate(rate)` - every read fails with probability `rate`
//!
//! All randomness comes from one seeded `ChaCha8Rng`, so runs are reproducible.

use num_complex::Complex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use super::ReadoutDevice;
use crate::acquisition::{Capture, CaptureStats, Frame, FrameGap};
use crate::error::{AcquisitionError, ReadoutError, Result};
use crate::store::HardwareRecord;
use crate::sweep::ToneBank;

/// Bit of the simulated address counter that flips on every swap.
const BANK_BIT: u32 = 12;

/// One notch-type resonator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resonator {
    /// Resonance frequency in MHz.
    pub f0: f64,
    /// Loaded quality factor.
    pub q: f64,
    /// Fractional dip depth at resonance, in (0, 1].
    pub depth: f64,
}

impl Resonator {
    /// Create a resonator.
    pub fn new(f0: f64, q: f64, depth: f64) -> Self {
        Self { f0, q, depth }
    }

    /// Complex transmission contribution at `freq` MHz (the dip subtracted from 1).
    fn dip(&self, freq: f64) -> Complex<f64> {
        let detuning = 2.0 * self.q * (freq - self.f0) / self.f0;
        Complex::new(self.depth, 0.0) / Complex::new(1.0, detuning)
    }
}

/// Resonator-model readout device.
#[derive(Debug, Clone)]
pub struct SimulatedReadout {
    sample_rate_mhz: f64,
    nfft: usize,
    tone_table_size: usize,
    frame_samples: usize,
    resonators: Vec<Resonator>,
    noise: f64,
    rng: ChaCha8Rng,
    failure_rate: f64,
    fail_reads: HashSet<usize>,
    stall_reads: HashSet<usize>,
    lose_swaps: HashSet<usize>,
    // loaded tone frequency by FFT bin
    tones_by_bin: HashMap<usize, f64>,
    wave_norm: f64,
    selection: Vec<usize>,
    reads: usize,
    swap_count: u32,
}

impl SimulatedReadout {
    /// Create a device with no resonators and no noise.
    pub fn new(
        sample_rate_mhz: f64,
        nfft: usize,
        tone_table_size: usize,
        frame_samples: usize,
    ) -> Self {
        Self {
            sample_rate_mhz,
            nfft,
            tone_table_size,
            frame_samples,
            resonators: Vec::new(),
            noise: 0.0,
            rng: ChaCha8Rng::seed_from_u64(0),
            failure_rate: 0.0,
            fail_reads: HashSet::new(),
            stall_reads: HashSet::new(),
            lose_swaps: HashSet::new(),
            tones_by_bin: HashMap::new(),
            wave_norm: 1.0,
            selection: Vec::new(),
            reads: 0,
            swap_count: 0,
        }
    }

    /// Add resonators to the model.
    pub fn with_resonators(mut self, resonators: impl IntoIterator<Item = Resonator>) -> Self {
        self.resonators.extend(resonators);
        self
    }

    /// Peak uniform noise per I/Q component, in calibrated units.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.abs();
        self
    }

    /// Seed the noise and failure generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Probability that any read fails.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fail the listed read calls with a hardware error.
    pub fn fail_reads(mut self, reads: &[usize]) -> Self {
        self.fail_reads.extend(reads);
        self
    }

    /// Time out the listed read calls.
    pub fn stall_reads(mut self, reads: &[usize]) -> Self {
        self.stall_reads.extend(reads);
        self
    }

    /// Drop two swaps halfway through the listed read calls.
    pub fn lose_swaps(mut self, reads: &[usize]) -> Self {
        self.lose_swaps.extend(reads);
        self
    }

    /// Read calls served so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Model transmission at `freq` MHz.
    pub fn s21(&self, freq: f64) -> Complex<f64> {
        self.resonators
            .iter()
            .fold(Complex::new(1.0, 0.0), |s21, r| s21 - r.dip(freq))
    }

    fn sample(&mut self, bin: usize) -> Complex<f64> {
        let signal = match self.tones_by_bin.get(&bin) {
            Some(freq) => self.s21(*freq) / self.wave_norm,
            None => Complex::new(0.0, 0.0),
        };
        if self.noise > 0.0 {
            let scale = self.noise / self.wave_norm;
            signal
                + Complex::new(
                    self.rng.gen_range(-scale..scale),
                    self.rng.gen_range(-scale..scale),
                )
        } else {
            signal
        }
    }

    /// Frames of the selected bins; a swap loss at frame `lose_at` skips two swaps first.
    fn frames(&mut self, nframes: usize, lose_at: Option<usize>) -> (Vec<Frame>, Vec<FrameGap>) {
        let mut frames = Vec::with_capacity(nframes);
        let mut gaps = Vec::new();
        let mut slot = 0;
        for n in 0..nframes {
            self.swap_count = self.swap_count.wrapping_add(1);
            if lose_at == Some(n) && n > 0 {
                self.swap_count = self.swap_count.wrapping_add(2);
                gaps.push(FrameGap {
                    frame: n,
                    missed: 2,
                    swap: self.swap_count,
                });
            }
            let mut samples = Vec::with_capacity(self.frame_samples);
            for _ in 0..self.frame_samples {
                let bin = self.selection[slot];
                samples.push(self.sample(bin));
                slot = (slot + 1) % self.selection.len();
            }
            frames.push(Frame::new(samples, self.swap_count << BANK_BIT));
        }
        (frames, gaps)
    }
}

impl ReadoutDevice for SimulatedReadout {
    fn sample_rate_mhz(&self) -> f64 {
        self.sample_rate_mhz
    }

    fn nfft(&self) -> usize {
        self.nfft
    }

    fn tone_table_size(&self) -> usize {
        self.tone_table_size
    }

    fn load_tones(&mut self, bank: &ToneBank) -> Result<f64> {
        if bank.tone_table_size != self.tone_table_size {
            return Err(ReadoutError::shape(format!(
                "bank built for a {}-sample table, device has {}",
                bank.tone_table_size, self.tone_table_size
            )));
        }
        let waveform = bank.waveform()?;
        self.tones_by_bin = bank
            .tones
            .iter()
            .map(|tone| (tone.fft_bin, bank.frequency(tone)))
            .collect();
        self.wave_norm = waveform.wave_norm;
        debug!(tones = bank.tones.len(), offset = bank.offset, "simulated bank loaded");
        Ok(self.wave_norm)
    }

    fn select_bins(&mut self, bins: &[usize]) -> Result<()> {
        if bins.is_empty() {
            return Err(ReadoutError::shape("no FFT bins selected"));
        }
        if let Some(bin) = bins.iter().find(|bin| **bin >= self.nfft) {
            return Err(ReadoutError::shape(format!(
                "FFT bin {bin} outside a {}-point transform",
                self.nfft
            )));
        }
        self.selection = bins.to_vec();
        Ok(())
    }

    fn read_frames(&mut self, nframes: usize) -> std::result::Result<Capture, AcquisitionError> {
        let read = self.reads;
        self.reads += 1;
        if self.selection.is_empty() {
            return Err(AcquisitionError {
                frames: Vec::new(),
                requested: nframes,
                stats: CaptureStats::default(),
                source: ReadoutError::shape("read before selecting bins"),
            });
        }

        let random_failure = self.failure_rate > 0.0 && self.rng.gen::<f64>() < self.failure_rate;
        let failure = if self.stall_reads.contains(&read) {
            Some(ReadoutError::Timeout {
                waited: Duration::from_millis(0),
                register: "simulated_addr".to_string(),
            })
        } else if self.fail_reads.contains(&read) || random_failure {
            Some(ReadoutError::hardware(format!("simulated failure on read {read}")))
        } else {
            None
        };

        let delivered = if failure.is_some() { nframes / 2 } else { nframes };
        let lose_at = self.lose_swaps.contains(&read).then_some(nframes / 2);
        let (frames, gaps) = self.frames(delivered, lose_at);
        let stats = CaptureStats {
            frames: frames.len(),
            elapsed: Duration::ZERO,
            idle_polls: 0,
            frame_samples: self.frame_samples,
        };
        match failure {
            Some(source) => Err(AcquisitionError {
                frames,
                requested: nframes,
                stats,
                source,
            }),
            None => Ok(Capture {
                frames,
                stats,
                gaps,
            }),
        }
    }

    // no attenuators in the model
    fn hardware_record(&self, epoch: f64) -> HardwareRecord {
        HardwareRecord {
            epoch,
            adc_atten: 0.0,
            dac_atten: 0.0,
            ntones: (!self.tones_by_bin.is_empty()).then_some(self.tones_by_bin.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::ToneAllocator;

    fn device() -> SimulatedReadout {
        SimulatedReadout::new(512.0, 1 << 14, 1 << 16, 64)
            .with_resonators([Resonator::new(100.0, 10_000.0, 0.9)])
    }

    #[test]
    fn s21_dips_at_resonance() {
        let device = device();
        assert!((device.s21(100.0).norm() - 0.1).abs() < 1e-12);
        assert!(device.s21(101.0).norm() > 0.99);
    }

    #[test]
    fn interleaves_selected_bins() {
        let allocator = ToneAllocator::new(512.0, 1 << 16, 1 << 14, 2).unwrap();
        let allocation = allocator.allocate(&[100.0, 300.0], &[0.0]).unwrap();
        let bank = allocator.bank(&allocation, 0.0).unwrap();
        let mut device = device();
        let wave_norm = device.load_tones(&bank).unwrap();
        device.select_bins(&bank.fft_bins()).unwrap();

        let capture = device.read_frames(3).unwrap();
        assert_eq!(capture.frames.len(), 3);
        let channels = capture.demultiplex(2).unwrap();
        assert!((channels[0][0] * wave_norm).norm() < 0.2);
        assert!((channels[1][5] * wave_norm).norm() > 0.99);
        assert_eq!(capture.frames[1].swap_count(BANK_BIT), capture.frames[0].swap_count(BANK_BIT) + 1);
    }

    #[test]
    fn scheduled_failures_deliver_partial_frames() {
        let mut device = device().fail_reads(&[1]).stall_reads(&[2]);
        device.select_bins(&[10]).unwrap();

        assert!(device.read_frames(4).is_ok());
        let err = device.read_frames(4).unwrap_err();
        assert_eq!(err.frames.len(), 2);
        assert!(matches!(err.source, ReadoutError::HardwareIo { .. }));
        let err = device.read_frames(4).unwrap_err();
        assert!(err.source.is_timeout());
        assert_eq!(device.reads(), 3);
    }

    #[test]
    fn lost_swaps_leave_a_reported_gap() {
        let mut device = device().lose_swaps(&[0]);
        device.select_bins(&[10]).unwrap();

        let capture = device.read_frames(4).unwrap();
        assert_eq!(capture.frames.len(), 4);
        assert_eq!(capture.gaps.len(), 1);
        assert_eq!(capture.gaps[0].frame, 2);
        let swaps: Vec<u32> = capture.frames.iter().map(|f| f.swap_count(BANK_BIT)).collect();
        assert_eq!(swaps, vec![1, 2, 5, 6]);
        assert!(device.read_frames(4).unwrap().is_contiguous());
    }

    #[test]
    fn certain_failure_rate_always_fails() {
        let mut device = device().with_failure_rate(1.0).with_seed(9);
        device.select_bins(&[10]).unwrap();
        for _ in 0..5 {
            assert!(device.read_frames(2).unwrap_err().is_recoverable());
        }
    }
}
