//! # KID Readout Core Library
//!
//! This crate is the core of a multiplexed microresonator readout. It streams time-ordered
//! complex samples out of an FPGA double buffer, schedules frequency sweeps of many
//! resonators through a limited number of simultaneously readable FFT bins, reduces the
//! captured samples to calibrated transmission (S21) estimates, and tracks each resonance
//! from sweep to sweep.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: frame decoding, the `BufferStreamReader` that follows the board's
//!   buffer swaps, and demultiplexing of interleaved channels.
//! - **`analysis`**: the `ResonanceConsolidator` that picks the next resonance estimate from a
//!   fit, the deepest measured point and the prior guess.
//! - **`config`**: `ReadoutConfig`, loaded from TOML and `KID_READOUT_` environment variables.
//! - **`dsp`**: FIR low-pass design and FFT convolution used by the block statistics.
//! - **`environment`**: temperature lookups from thermometer logs.
//! - **`error`**: the `ReadoutError` enum, partial `AcquisitionError`s and
//!   `CalibrationWarning`s.
//! - **`hardware`**: the `FpgaLink` and `ReadoutDevice` seams, the register-level
//!   `RoachBoard`, a `MockFpga` and a resonator-model `SimulatedReadout`.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`model`**: `DataBlock` (one averaged measurement) and `SweepData` (frequency-sorted
//!   index of a sweep).
//! - **`service`**: the async `ReadoutService` surface and its `Coordinator`.
//! - **`store`**: the readout file, its writer and its read-side projections.
//! - **`sweep`**: tone allocation, waveform synthesis and sweep sequencing.

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod dsp;
pub mod environment;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod model;
pub mod service;
pub mod store;
pub mod sweep;

pub use error::{ReadoutError, Result};
