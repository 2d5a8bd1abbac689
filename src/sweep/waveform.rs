//! DAC waveform synthesis.
//!
//! The tone table is one period of a sum of complex exponentials, one per tone, placed at
//! the tones' table indices. It is built in the frequency domain and brought to the time
//! domain with a single inverse FFT, then scaled so the largest I or Q component hits i16
//! full scale.

use num_complex::Complex;
use rustfft::FftPlanner;

use super::allocator::ToneBank;
use crate::acquisition::Frame;
use crate::error::{ReadoutError, Result};

/// Largest DAC code.
pub const FULL_SCALE: f64 = i16::MAX as f64;

/// A quantized tone table ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Integer-valued I/Q samples, one table period.
    pub samples: Vec<Complex<f64>>,
    /// Factor that maps DAC codes back to unit-amplitude tones.
    pub wave_norm: f64,
}

impl Waveform {
    /// Samples in the board's big-endian i16 layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        Frame::encode(&self.samples)
    }

    /// Table length.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True for an empty table.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl ToneBank {
    /// Synthesize the tone table of this bank.
    pub fn waveform(&self) -> Result<Waveform> {
        let size = self.tone_table_size;
        if size == 0 {
            return Err(ReadoutError::shape("tone table size must be positive"));
        }
        let mut spectrum = vec![Complex::new(0.0, 0.0); size];
        for tone in &self.tones {
            if tone.tone_index >= size {
                return Err(ReadoutError::shape(format!(
                    "tone index {} outside a {size}-sample table",
                    tone.tone_index
                )));
            }
            spectrum[tone.tone_index] += Complex::from_polar(tone.amplitude, tone.phase);
        }

        let mut planner = FftPlanner::<f64>::new();
        planner.plan_fft_inverse(size).process(&mut spectrum);

        let peak = spectrum
            .iter()
            .map(|s| s.re.abs().max(s.im.abs()))
            .fold(0.0, f64::max);
        if peak == 0.0 {
            return Err(ReadoutError::shape("tone bank has no energy"));
        }
        let scale = FULL_SCALE / peak;
        let samples = spectrum
            .iter()
            .map(|s| Complex::new((s.re * scale).round(), (s.im * scale).round()))
            .collect();
        Ok(Waveform {
            samples,
            wave_norm: 1.0 / scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::allocator::ToneAllocator;

    fn bank(targets: &[f64]) -> ToneBank {
        let allocator = ToneAllocator::new(512.0, 1024, 256, 1)
            .unwrap()
            .with_phase_seed(7);
        let allocation = allocator.allocate(targets, &[0.0]).unwrap();
        allocator.bank(&allocation, 0.0).unwrap()
    }

    #[test]
    fn single_tone_is_full_scale_exponential() {
        let bank = bank(&[64.0]);
        let waveform = bank.waveform().unwrap();
        assert_eq!(waveform.len(), 1024);

        let peak = waveform
            .samples
            .iter()
            .map(|s| s.re.abs().max(s.im.abs()))
            .fold(0.0, f64::max);
        assert_eq!(peak, FULL_SCALE);
        // one tone of unit amplitude has magnitude 1 before scaling
        let magnitude = waveform.samples[3].norm() * waveform.wave_norm;
        assert!((magnitude - 1.0).abs() < 1e-3);
    }

    #[test]
    fn spectrum_peaks_at_tone_indexes() {
        let bank = bank(&[64.0, 100.0, 300.0]);
        let waveform = bank.waveform().unwrap();

        let mut spectrum = waveform.samples.clone();
        FftPlanner::<f64>::new()
            .plan_fft_forward(spectrum.len())
            .process(&mut spectrum);
        let mut loudest: Vec<usize> = (0..spectrum.len()).collect();
        loudest.sort_by(|a, b| spectrum[*b].norm().total_cmp(&spectrum[*a].norm()));
        let mut top: Vec<usize> = loudest[..3].to_vec();
        top.sort_unstable();
        assert_eq!(top, bank.tone_indexes());
    }

    #[test]
    fn same_seed_same_waveform() {
        assert_eq!(bank(&[64.0, 80.0]).waveform().unwrap(), bank(&[64.0, 80.0]).waveform().unwrap());
    }
}
