//! In-memory measurement model.
//!
//! - [`DataBlock`] - one averaged capture of one channel at one offset, with statistics
//!   computed at most once
//! - [`SweepData`] - the blocks of a sweep sorted by frequency, with per-step and per-channel
//!   selection

pub mod data_block;
pub mod sweep_data;

pub use data_block::{BlockMeta, BlockStats, DataBlock, EnvironmentTags, DEFAULT_FILTER_LENGTH};
pub use sweep_data::{SweepData, Trace};
