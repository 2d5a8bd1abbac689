//! Sweep step sequencing.
//!
//! A sweep walks a [`SweepPlan`] offset by offset:
//!
//! ```text
//! for each offset (sweep index = position):
//!     load the offset-shifted tone bank, wait `settle`
//!     for each channel batch:
//!         select its bins, wait `batch_settle`, read frames
//!         demultiplex, one DataBlock per real channel
//! ```
//!
//! Settle waits are plain delays; the board offers no acknowledgment. A failed batch read,
//! including one whose capture dropped a frame, is retried up to `max_retries` times and
//! then skipped, leaving a gap in the sweep instead of aborting it. Only non-recoverable
//! errors (bad shapes, invalid plans) end a sweep.

use chrono::Utc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::allocator::{Allocation, SweepPlan, ToneAllocator, ToneBank};
use crate::acquisition::Capture;
use crate::config::SweepConfig;
use crate::error::{ReadoutError, Result};
use crate::hardware::ReadoutDevice;
use crate::model::{BlockMeta, DataBlock, SweepData};

/// Timing and retry policy of a sequencer.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerConfig {
    /// Frames read per batch.
    pub reads_per_step: usize,
    /// Wait after loading a tone bank.
    pub settle: Duration,
    /// Wait after selecting bins.
    pub batch_settle: Duration,
    /// Extra attempts for a failed batch.
    pub max_retries: usize,
    /// Statistics filter length of emitted blocks.
    pub filter_length: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self::from(&SweepConfig::default())
    }
}

impl From<&SweepConfig> for SequencerConfig {
    fn from(sweep: &SweepConfig) -> Self {
        Self {
            reads_per_step: sweep.reads_per_step,
            settle: sweep.settle(),
            batch_settle: sweep.batch_settle(),
            max_retries: sweep.max_retries,
            filter_length: sweep.filter_length,
        }
    }
}

/// A batch or bank load that was given up on.
#[derive(Debug)]
pub struct StepFailure {
    /// Offset step, `None` for a time-stream capture.
    pub sweep_index: Option<usize>,
    /// Batch that was skipped; `None` when the whole step failed to load.
    pub batch: Option<usize>,
    /// Attempts made.
    pub attempts: usize,
    /// Error of the last attempt.
    pub error: ReadoutError,
}

/// A completed sweep and the gaps it has.
#[derive(Debug)]
pub struct SweepOutcome {
    /// Blocks of every real channel that was read.
    pub sweep: SweepData,
    /// Skipped batches and steps.
    pub failures: Vec<StepFailure>,
}

impl SweepOutcome {
    /// True when every batch of every step was read.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Blocks captured at fixed tones, without a sweep index.
#[derive(Debug)]
pub struct TimestreamOutcome {
    /// One block per real channel, in batch order.
    pub blocks: Vec<DataBlock>,
    /// Skipped batches.
    pub failures: Vec<StepFailure>,
    /// Tones that were loaded.
    pub bank: ToneBank,
}

/// Runs sweeps and time-stream captures against a [`ReadoutDevice`].
#[derive(Debug, Clone, Default)]
pub struct SweepSequencer {
    config: SequencerConfig,
}

impl SweepSequencer {
    /// Create a sequencer.
    pub fn new(config: SequencerConfig) -> Self {
        Self { config }
    }

    /// Sequencer settings.
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Run every step of `plan`.
    #[instrument(skip(self, device, plan), fields(steps = plan.steps(), batches = plan.allocation.batches.len()))]
    pub fn run<D: ReadoutDevice + ?Sized>(
        &self,
        device: &mut D,
        plan: &SweepPlan,
        sweep_id: u32,
    ) -> Result<SweepOutcome> {
        let mut sweep = SweepData::new(sweep_id);
        let mut failures = Vec::new();

        for (sweep_index, bank) in plan.banks.iter().enumerate() {
            info!(sweep_index, offset = bank.offset, "sweep step");
            let wave_norm = match self.load(device, bank) {
                Ok(wave_norm) => wave_norm,
                Err((attempts, error)) if error.is_recoverable() => {
                    warn!(sweep_index, %error, "skipping step, tone bank did not load");
                    failures.push(StepFailure {
                        sweep_index: Some(sweep_index),
                        batch: None,
                        attempts,
                        error,
                    });
                    continue;
                }
                Err((_, error)) => return Err(error),
            };
            thread::sleep(self.config.settle);

            let blocks = self.read_batches(
                device,
                &plan.allocation,
                bank,
                wave_norm,
                Some(sweep_index),
                &mut failures,
            )?;
            for block in blocks {
                sweep.add_block(block);
            }
        }

        info!(
            blocks = sweep.len(),
            failures = failures.len(),
            "sweep complete"
        );
        Ok(SweepOutcome { sweep, failures })
    }

    /// Capture time streams at fixed tones.
    ///
    /// Each batch is read once with `nframes` frames; blocks carry no sweep index.
    #[instrument(skip(self, device, allocator, frequencies), fields(tones = frequencies.len()))]
    pub fn capture_timestreams<D: ReadoutDevice + ?Sized>(
        &self,
        device: &mut D,
        allocator: &ToneAllocator,
        frequencies: &[f64],
        nframes: usize,
    ) -> Result<TimestreamOutcome> {
        let allocation = allocator.allocate(frequencies, &[0.0])?;
        let bank = allocator.bank(&allocation, 0.0)?;
        let wave_norm = self.load(device, &bank).map_err(|(_, error)| error)?;
        thread::sleep(self.config.settle);

        let capture = Self {
            config: SequencerConfig {
                reads_per_step: nframes,
                ..self.config.clone()
            },
        };
        let mut failures = Vec::new();
        let blocks =
            capture.read_batches(device, &allocation, &bank, wave_norm, None, &mut failures)?;
        info!(blocks = blocks.len(), "time streams captured");
        Ok(TimestreamOutcome {
            blocks,
            failures,
            bank,
        })
    }

    /// Load a bank, retrying recoverable failures.
    fn load<D: ReadoutDevice + ?Sized>(
        &self,
        device: &mut D,
        bank: &ToneBank,
    ) -> std::result::Result<f64, (usize, ReadoutError)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match device.load_tones(bank) {
                Ok(wave_norm) => return Ok(wave_norm),
                Err(error) if error.is_recoverable() && attempts <= self.config.max_retries => {
                    warn!(attempts, %error, "tone bank load failed, retrying");
                }
                Err(error) => return Err((attempts, error)),
            }
        }
    }

    fn read_batches<D: ReadoutDevice + ?Sized>(
        &self,
        device: &mut D,
        allocation: &Allocation,
        bank: &ToneBank,
        wave_norm: f64,
        sweep_index: Option<usize>,
        failures: &mut Vec<StepFailure>,
    ) -> Result<Vec<DataBlock>> {
        let mut blocks = Vec::with_capacity(allocation.channels());
        for (batch, channels) in allocation.batches.iter().enumerate() {
            let bins: Vec<usize> = channels.iter().map(|c| bank.tones[*c].fft_bin).collect();
            debug!(batch, ?bins, "reading batch");

            let (capture, t0) = match self.read_batch(device, &bins) {
                Ok(read) => read,
                Err((attempts, error)) if error.is_recoverable() => {
                    warn!(?sweep_index, batch, attempts, %error, "skipping batch");
                    failures.push(StepFailure {
                        sweep_index,
                        batch: Some(batch),
                        attempts,
                        error,
                    });
                    continue;
                }
                Err((_, error)) => return Err(error),
            };

            let streams = capture.demultiplex(channels.len())?;
            for (channel, samples) in channels.iter().zip(streams) {
                if allocation.is_placeholder(*channel) {
                    continue;
                }
                let tone = &bank.tones[*channel];
                let meta = BlockMeta {
                    tone: tone.tone_index,
                    fft_bin: tone.fft_bin,
                    tone_table_size: bank.tone_table_size,
                    nfft: device.nfft(),
                    wave_norm,
                    t0,
                    sample_rate: device.sample_rate_mhz(),
                    sweep_index,
                    channel_id: *channel,
                    tags: None,
                };
                blocks.push(DataBlock::with_filter_length(
                    samples,
                    meta,
                    self.config.filter_length,
                ));
            }
        }
        Ok(blocks)
    }

    /// Select bins and read one batch; returns the capture and its start time.
    fn read_batch<D: ReadoutDevice + ?Sized>(
        &self,
        device: &mut D,
        bins: &[usize],
    ) -> std::result::Result<(Capture, f64), (usize, ReadoutError)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = device.select_bins(bins).and_then(|()| {
                thread::sleep(self.config.batch_settle);
                let t0 = epoch_seconds();
                let capture = device
                    .read_frames(self.config.reads_per_step)
                    .map_err(|err| {
                        debug!(frames = err.frames.len(), "discarding partial batch read");
                        ReadoutError::from(err)
                    })?;
                // samples across a dropped frame are not one time series
                capture.ensure_contiguous()?;
                Ok((capture, t0))
            });
            match result {
                Ok(read) => return Ok(read),
                Err(error) if error.is_recoverable() && attempts <= self.config.max_retries => {
                    warn!(attempts, %error, "batch read failed, retrying");
                }
                Err(error) => return Err((attempts, error)),
            }
        }
    }
}

/// Current time in seconds since the UNIX epoch.
pub fn epoch_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::{Resonator, SimulatedReadout};

    fn quick() -> SequencerConfig {
        SequencerConfig {
            reads_per_step: 2,
            settle: Duration::ZERO,
            batch_settle: Duration::ZERO,
            max_retries: 1,
            filter_length: 16,
        }
    }

    fn readout(resonators: &[f64]) -> SimulatedReadout {
        SimulatedReadout::new(512.0, 1 << 14, 1 << 16, 256)
            .with_resonators(resonators.iter().map(|f| Resonator::new(*f, 20_000.0, 0.8)))
            .with_seed(3)
    }

    fn allocator() -> ToneAllocator {
        ToneAllocator::new(512.0, 1 << 16, 1 << 14, 4).unwrap()
    }

    #[test]
    fn sweep_emits_one_block_per_real_channel_and_offset() {
        let targets = [100.0, 120.0, 140.0, 160.0, 180.0];
        let offsets = [-0.02, -0.01, 0.0, 0.01, 0.02];
        let plan = allocator().plan(&targets, &offsets).unwrap();
        let mut device = readout(&targets);

        let outcome = SweepSequencer::new(quick())
            .run(&mut device, &plan, 1)
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.sweep.len(), targets.len() * offsets.len());
        for step in 0..offsets.len() {
            assert_eq!(outcome.sweep.select_by_index(step).len(), targets.len());
        }
        // placeholders (ids 5..8) never reach the index
        assert!(outcome.sweep.channel_ids().iter().all(|c| *c < 5));
        assert!(outcome.sweep.freqs().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn failed_batch_is_retried() {
        let plan = allocator().plan(&[100.0, 200.0], &[0.0]).unwrap();
        let mut device = readout(&[]).fail_reads(&[0]);

        let outcome = SweepSequencer::new(quick())
            .run(&mut device, &plan, 1)
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.sweep.len(), 2);
    }

    #[test]
    fn exhausted_retries_leave_a_gap() {
        let plan = allocator().plan(&[100.0, 200.0], &[0.0, 0.01, 0.02]).unwrap();
        // step 1 is the second read; with one retry it fails twice
        let mut device = readout(&[]).fail_reads(&[1, 2]);

        let outcome = SweepSequencer::new(quick())
            .run(&mut device, &plan, 1)
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].sweep_index, Some(1));
        assert_eq!(outcome.failures[0].attempts, 2);
        assert!(outcome.sweep.select_by_index(1).is_empty());
        assert_eq!(outcome.sweep.select_by_index(0).len(), 2);
        assert_eq!(outcome.sweep.select_by_index(2).len(), 2);
    }

    #[test]
    fn dropped_frame_in_a_capture_is_retried() {
        let plan = allocator().plan(&[100.0, 200.0], &[0.0]).unwrap();
        let mut device = readout(&[]).lose_swaps(&[0]);

        let outcome = SweepSequencer::new(quick())
            .run(&mut device, &plan, 1)
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.sweep.len(), 2);
        assert_eq!(device.reads(), 2);
    }

    #[test]
    fn dropped_frame_without_retries_skips_the_batch() {
        let plan = allocator().plan(&[100.0, 200.0], &[0.0, 0.01]).unwrap();
        let mut device = readout(&[]).lose_swaps(&[0]);

        let outcome = SweepSequencer::new(SequencerConfig {
            max_retries: 0,
            ..quick()
        })
        .run(&mut device, &plan, 1)
        .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        let failure = &outcome.failures[0];
        assert_eq!(failure.sweep_index, Some(0));
        assert_eq!(failure.attempts, 1);
        assert!(matches!(
            failure.error,
            ReadoutError::FrameGap {
                expected: 2,
                observed: 4
            }
        ));
        assert!(outcome.sweep.select_by_index(0).is_empty());
        assert_eq!(outcome.sweep.select_by_index(1).len(), 2);
    }

    #[test]
    fn timestreams_have_no_sweep_index() {
        let mut device = readout(&[100.0]);
        let outcome = SweepSequencer::new(quick())
            .capture_timestreams(&mut device, &allocator(), &[100.0, 150.0, 210.0], 4)
            .unwrap();

        assert_eq!(outcome.blocks.len(), 3);
        assert!(outcome.blocks.iter().all(|b| b.meta().sweep_index.is_none()));
        assert_eq!(outcome.blocks[0].samples().len(), 4 * 256 / 4);
    }
}
