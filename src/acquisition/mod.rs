//! Frame acquisition from the board's double buffer.
//!
//! - [`Frame`] - one fixed-length block of complex samples plus the address counter at capture
//! - [`Capture`] - the frames of one read, their timing and any detected gaps
//! - [`BufferStreamReader`] - the polling handshake that extracts frames in capture order
//!
//! Frames are stored by the board as big-endian signed 16-bit I/Q pairs. While k FFT bins
//! are selected, consecutive samples cycle through the k readout slots; use
//! [`Capture::demultiplex`] to split them per channel.

pub mod reader;

pub use reader::{BufferStreamReader, ReaderConfig};

use num_complex::Complex;
use std::time::Duration;

use crate::error::{ReadoutError, Result};

/// Bytes per complex sample (two big-endian i16).
pub const BYTES_PER_SAMPLE: usize = 4;

/// One block of complex samples read from an inactive bank.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Samples in the order the board wrote them.
    pub samples: Vec<Complex<f64>>,
    /// Value of the status/address register when the bank was released.
    pub address: u32,
}

impl Frame {
    /// Create a frame from already-decoded samples.
    pub fn new(samples: Vec<Complex<f64>>, address: u32) -> Self {
        Self { samples, address }
    }

    /// Decode raw bank bytes (big-endian i16 I, i16 Q per sample).
    pub fn decode(bytes: &[u8], address: u32) -> Result<Self> {
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(ReadoutError::shape(format!(
                "frame of {} bytes is not a whole number of I/Q samples",
                bytes.len()
            )));
        }
        let samples = bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|word| {
                let i = i16::from_be_bytes([word[0], word[1]]);
                let q = i16::from_be_bytes([word[2], word[3]]);
                Complex::new(f64::from(i), f64::from(q))
            })
            .collect();
        Ok(Self { samples, address })
    }

    /// Encode samples back to the board's byte layout, saturating to i16.
    pub fn encode(samples: &[Complex<f64>]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for sample in samples {
            bytes.extend_from_slice(&saturate(sample.re).to_be_bytes());
            bytes.extend_from_slice(&saturate(sample.im).to_be_bytes());
        }
        bytes
    }

    /// Number of buffer swaps the address counter has seen.
    pub fn swap_count(&self, bank_bit: u32) -> u32 {
        self.address >> bank_bit
    }
}

fn saturate(value: f64) -> i16 {
    value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Timing of one buffer read, used for adaptive pacing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureStats {
    /// Frames successfully read.
    pub frames: usize,
    /// Wall time from the first poll to the last frame.
    pub elapsed: Duration,
    /// Status polls that did not observe a swap while waiting between frames.
    pub idle_polls: u64,
    /// Complex samples per frame.
    pub frame_samples: usize,
}

impl CaptureStats {
    /// Delivered sample rate.
    pub fn samples_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.frames * self.frame_samples) as f64 / secs
        } else {
            0.0
        }
    }

    /// Mean idle polls per frame.
    pub fn idle_per_read(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.idle_polls as f64 / self.frames as f64
        }
    }
}

/// A discontinuity between two consecutive frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGap {
    /// Index of the first frame after the gap.
    pub frame: usize,
    /// Swaps that happened without a read.
    pub missed: u32,
    /// Swap count of the first frame after the gap.
    pub swap: u32,
}

/// The result of one buffer read.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    /// Frames in capture order.
    pub frames: Vec<Frame>,
    /// Read timing.
    pub stats: CaptureStats,
    /// Dropped-frame discontinuities.
    pub gaps: Vec<FrameGap>,
}

impl Capture {
    /// True when every frame followed its predecessor by exactly one swap.
    pub fn is_contiguous(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Fail with [`ReadoutError::FrameGap`] at the first dropped frame.
    pub fn ensure_contiguous(&self) -> Result<()> {
        match self.gaps.first() {
            Some(gap) => Err(ReadoutError::FrameGap {
                expected: gap.swap.wrapping_sub(gap.missed),
                observed: gap.swap,
            }),
            None => Ok(()),
        }
    }

    /// All samples, frame after frame.
    pub fn samples(&self) -> Vec<Complex<f64>> {
        self.frames
            .iter()
            .flat_map(|frame| frame.samples.iter().copied())
            .collect()
    }

    /// Address counters of each frame.
    pub fn addresses(&self) -> Vec<u32> {
        self.frames.iter().map(|frame| frame.address).collect()
    }

    /// Split the interleaved stream into `nchan` per-slot sample vectors.
    ///
    /// A trailing partial cycle is dropped so every channel has the same length.
    pub fn demultiplex(&self, nchan: usize) -> Result<Vec<Vec<Complex<f64>>>> {
        if nchan == 0 {
            return Err(ReadoutError::shape("cannot demultiplex into zero channels"));
        }
        let samples = self.samples();
        let per_channel = samples.len() / nchan;
        let mut channels = vec![Vec::with_capacity(per_channel); nchan];
        for cycle in samples.chunks_exact(nchan) {
            for (slot, sample) in cycle.iter().enumerate() {
                channels[slot].push(*sample);
            }
        }
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_big_endian_pairs() {
        let bytes = [0x00, 0x01, 0xff, 0xff, 0x7f, 0xff, 0x80, 0x00];
        let frame = Frame::decode(&bytes, 4096).unwrap();
        assert_eq!(frame.samples[0], Complex::new(1.0, -1.0));
        assert_eq!(frame.samples[1], Complex::new(32767.0, -32768.0));
        assert_eq!(frame.swap_count(12), 1);
    }

    #[test]
    fn decode_rejects_partial_sample() {
        assert!(matches!(
            Frame::decode(&[0, 1, 2], 0),
            Err(ReadoutError::DataShape { .. })
        ));
    }

    #[test]
    fn encode_saturates() {
        let bytes = Frame::encode(&[Complex::new(40000.0, -3.4)]);
        let frame = Frame::decode(&bytes, 0).unwrap();
        assert_eq!(frame.samples[0], Complex::new(32767.0, -3.0));
    }

    #[test]
    fn demultiplex_round_robin_slots() {
        let samples: Vec<_> = (0..10).map(|i| Complex::new(f64::from(i), 0.0)).collect();
        let capture = Capture {
            frames: vec![Frame::new(samples, 0)],
            ..Default::default()
        };
        let channels = capture.demultiplex(4).unwrap();
        assert_eq!(channels.len(), 4);
        assert_eq!(channels[1], vec![Complex::new(1.0, 0.0), Complex::new(5.0, 0.0)]);
        assert!(channels.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn stats_rates() {
        let stats = CaptureStats {
            frames: 4,
            elapsed: Duration::from_secs(2),
            idle_polls: 10,
            frame_samples: 4096,
        };
        assert_eq!(stats.samples_per_second(), 8192.0);
        assert_eq!(stats.idle_per_read(), 2.5);
    }
}
