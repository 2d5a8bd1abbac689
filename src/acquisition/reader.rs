//! Double-buffer stream reader.
//!
//! The board writes into two physical banks and flips one bit of the `<buffer>_addr`
//! register every time it swaps. A read is:
//!
//! ```text
//! poll until the bank bit flips          (edge-triggered start)
//! repeat N times:
//!     read the bank the writer just left
//!     record the address register
//!     poll until the next flip           (only if another frame follows)
//! ```
//!
//! This never reads a bank that is being written, at the cost of up to one swap period per
//! frame. Each poll wait is bounded; a stalled link surfaces as [`ReadoutError::Timeout`].
//! Any failure after the start returns the frames collected so far inside an
//! [`AcquisitionError`].

use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::{Capture, CaptureStats, Frame, FrameGap, BYTES_PER_SAMPLE};
use crate::config::HardwareConfig;
use crate::error::{AcquisitionError, ReadoutError};
use crate::hardware::FpgaLink;

/// Settings for [`BufferStreamReader`].
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Double buffer name; banks are `<name>_a` and `<name>_b`.
    pub buffer_name: String,
    /// Complex samples per frame.
    pub frame_samples: usize,
    /// Bit of the address register that flips on every swap.
    pub bank_bit: u32,
    /// Bound on one swap wait.
    pub poll_timeout: Duration,
    /// Stop at the first dropped frame.
    pub abort_on_gap: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::from(&HardwareConfig::default())
    }
}

impl From<&HardwareConfig> for ReaderConfig {
    fn from(hw: &HardwareConfig) -> Self {
        Self {
            buffer_name: hw.buffer_name.clone(),
            frame_samples: hw.frame_samples,
            bank_bit: hw.bank_bit,
            poll_timeout: hw.poll_timeout(),
            abort_on_gap: hw.abort_on_gap,
        }
    }
}

/// Reads time-ordered frames from a hardware double buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferStreamReader {
    config: ReaderConfig,
}

/// Mutable state of one read, turned into a `Capture` or an `AcquisitionError`.
struct ReadState {
    frames: Vec<Frame>,
    gaps: Vec<FrameGap>,
    idle_polls: u64,
    started: Instant,
}

impl BufferStreamReader {
    /// Create a reader with the given settings.
    pub fn new(config: ReaderConfig) -> Self {
        Self { config }
    }

    /// Reader settings.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    fn status_register(&self) -> String {
        format!("{}_addr", self.config.buffer_name)
    }

    fn bank_mask(&self) -> u32 {
        1u32 << self.config.bank_bit
    }

    /// Read `nframes` frames in capture order.
    ///
    /// On failure the frames read before the error are returned inside the
    /// [`AcquisitionError`]; the caller decides whether to retry.
    pub fn read_frames<L: FpgaLink + ?Sized>(
        &self,
        link: &mut L,
        nframes: usize,
    ) -> Result<Capture, AcquisitionError> {
        let mut state = ReadState {
            frames: Vec::with_capacity(nframes),
            gaps: Vec::new(),
            idle_polls: 0,
            started: Instant::now(),
        };
        match self.run(link, nframes, &mut state) {
            Ok(()) => {
                let stats = self.stats(&state);
                info!(
                    frames = nframes,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    samples_per_sec = stats.samples_per_second(),
                    idle_per_read = stats.idle_per_read(),
                    "buffer read complete"
                );
                Ok(Capture {
                    frames: state.frames,
                    stats,
                    gaps: state.gaps,
                })
            }
            Err(source) => {
                let stats = self.stats(&state);
                warn!(
                    frames = state.frames.len(),
                    requested = nframes,
                    error = %source,
                    "read only partway because of error"
                );
                Err(AcquisitionError {
                    frames: state.frames,
                    requested: nframes,
                    stats,
                    source,
                })
            }
        }
    }

    fn stats(&self, state: &ReadState) -> CaptureStats {
        CaptureStats {
            frames: state.frames.len(),
            elapsed: state.started.elapsed(),
            idle_polls: state.idle_polls,
            frame_samples: self.config.frame_samples,
        }
    }

    fn run<L: FpgaLink + ?Sized>(
        &self,
        link: &mut L,
        nframes: usize,
        state: &mut ReadState,
    ) -> Result<(), ReadoutError> {
        let register = self.status_register();
        let mask = self.bank_mask();
        let nbytes = self.config.frame_samples * BYTES_PER_SAMPLE;

        let level = link.read_uint(&register)? & mask;
        // Start-edge polls are not counted as idle
        let mut start_idle = 0;
        let mut address = self.wait_for_swap(link, &register, level, &mut start_idle)?;

        for n in 0..nframes {
            let bank = address & mask;
            let bram = if bank != 0 {
                format!("{}_a", self.config.buffer_name)
            } else {
                format!("{}_b", self.config.buffer_name)
            };
            let bytes = link.read(&bram, nbytes)?;
            let frame = Frame::decode(&bytes, address)?;

            if let Some(previous) = state.frames.last() {
                let expected = previous.swap_count(self.config.bank_bit).wrapping_add(1);
                let observed = frame.swap_count(self.config.bank_bit);
                if observed != expected {
                    let missed = observed.wrapping_sub(expected);
                    warn!(frame = n, missed, "dropped frame between reads");
                    if self.config.abort_on_gap {
                        return Err(ReadoutError::FrameGap { expected, observed });
                    }
                    state.gaps.push(FrameGap {
                        frame: n,
                        missed,
                        swap: observed,
                    });
                }
            }
            trace!(frame = n, address, bram = %bram, "frame read");
            state.frames.push(frame);

            if n + 1 < nframes {
                address = self.wait_for_swap(link, &register, bank, &mut state.idle_polls)?;
            }
        }
        debug!(frames = nframes, gaps = state.gaps.len(), "frames collected");
        Ok(())
    }

    /// Poll until the bank bit differs from `level`; returns the new register value.
    fn wait_for_swap<L: FpgaLink + ?Sized>(
        &self,
        link: &mut L,
        register: &str,
        level: u32,
        idle: &mut u64,
    ) -> Result<u32, ReadoutError> {
        let mask = self.bank_mask();
        let started = Instant::now();
        loop {
            let address = link.read_uint(register)?;
            if address & mask != level {
                return Ok(address);
            }
            *idle += 1;
            let waited = started.elapsed();
            if waited > self.config.poll_timeout {
                return Err(ReadoutError::Timeout {
                    waited,
                    register: register.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockFpga;

    fn reader(abort_on_gap: bool) -> BufferStreamReader {
        BufferStreamReader::new(ReaderConfig {
            buffer_name: "ppout0".to_string(),
            frame_samples: 64,
            bank_bit: 12,
            poll_timeout: Duration::from_millis(50),
            abort_on_gap,
        })
    }

    #[test]
    fn reads_contiguous_frames() {
        let mut fpga = MockFpga::new("ppout0", 64, 12).with_polls_per_swap(3);
        let capture = reader(false).read_frames(&mut fpga, 5).unwrap();

        assert_eq!(capture.frames.len(), 5);
        assert!(capture.is_contiguous());
        let swaps: Vec<u32> = capture.frames.iter().map(|f| f.swap_count(12)).collect();
        for pair in swaps.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert!(capture.stats.idle_polls > 0);
        assert_eq!(capture.frames[0].samples.len(), 64);
    }

    #[test]
    fn frame_contents_come_from_the_released_bank() {
        let mut fpga = MockFpga::new("ppout0", 16, 12).with_polls_per_swap(2);
        let capture = reader(false).read_frames(&mut fpga, 3).unwrap();
        for frame in &capture.frames {
            // The mock stamps each frame with the swap count that released it
            assert_eq!(frame.samples[0].re, f64::from(frame.swap_count(12) as i16));
        }
    }

    #[test]
    fn read_error_returns_partial_frames() {
        let mut fpga = MockFpga::new("ppout0", 64, 12).fail_read_at(3);
        let err = reader(false).read_frames(&mut fpga, 8).unwrap_err();

        assert_eq!(err.frames.len(), 3);
        assert_eq!(err.requested, 8);
        assert!(matches!(err.source, ReadoutError::HardwareIo { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn stalled_swap_times_out_with_partial_frames() {
        let mut fpga = MockFpga::new("ppout0", 64, 12).stall_after_swaps(3);
        let err = reader(false).read_frames(&mut fpga, 8).unwrap_err();

        assert!(err.source.is_timeout());
        assert!(err.is_recoverable());
        assert_eq!(err.frames.len(), 2);
    }

    #[test]
    fn lost_swaps_are_reported_as_gap() {
        let mut fpga = MockFpga::new("ppout0", 64, 12).lose_swaps_at(4);
        let capture = reader(false).read_frames(&mut fpga, 4).unwrap();

        assert_eq!(capture.frames.len(), 4);
        assert_eq!(capture.gaps.len(), 1);
        let gap = capture.gaps[0];
        assert_eq!((gap.frame, gap.missed), (2, 2));
        assert_eq!(gap.swap, capture.frames[2].swap_count(12));
        assert!(matches!(
            capture.ensure_contiguous(),
            Err(ReadoutError::FrameGap { expected, observed }) if observed == expected + 2
        ));
    }

    #[test]
    fn lost_swaps_abort_when_configured() {
        let mut fpga = MockFpga::new("ppout0", 64, 12).lose_swaps_at(4);
        let err = reader(true).read_frames(&mut fpga, 4).unwrap_err();

        assert!(matches!(err.source, ReadoutError::FrameGap { .. }));
        assert_eq!(err.frames.len(), 2);
    }
}
