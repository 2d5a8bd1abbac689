//! Sweep scheduling.
//!
//! - [`allocator`] - maps target frequencies to tone-table indices and FFT bins and batches
//!   channels by per-read bin capacity
//! - [`waveform`] - synthesizes the DAC tone table of a bank
//! - [`sequencer`] - steps the banks across frequency offsets and reads every batch

pub mod allocator;
pub mod sequencer;
pub mod waveform;

pub use allocator::{linear_offsets, Allocation, SweepPlan, Tone, ToneAllocator, ToneBank};
pub use sequencer::{
    epoch_seconds, SequencerConfig, StepFailure, SweepOutcome, SweepSequencer,
    TimestreamOutcome,
};
pub use waveform::Waveform;
