//! Custom error types for the readout.
//!
//! This module defines the primary error type, `ReadoutError`, used across acquisition,
//! sweep scheduling and the persisted store. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the failure modes of a single-board readout
//! session.
//!
//! ## Error Hierarchy
//!
//! - **`HardwareIo`**: a recoverable link failure. The caller retries the step or skips it.
//! - **`Timeout`**: a buffer swap was never observed within the poll bound; the link stalled.
//! - **`DataShape`**: waveform length mismatch or too few samples for the filter warm-up.
//!   Fatal to the call that raised it only.
//! - **`FrameGap`**: two consecutive frames were more than one buffer swap apart.
//! - **`BinCollision`**: two simultaneously-read tones landed in the same FFT bin.
//! - **`Store`**: a required field of the persisted container is missing or malformed.
//!
//! Low-confidence calibration conditions are deliberately not errors; see
//! [`CalibrationWarning`]. Acquisition failures that happen mid-stream carry the frames
//! captured so far in [`AcquisitionError`].

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::acquisition::{CaptureStats, Frame};

/// Convenience alias for results using the readout error type.
pub type Result<T> = std::result::Result<T, ReadoutError>;

/// Failure modes of a readout session.
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// Link failure while talking to the board.
    #[error("Hardware I/O error: {message}")]
    HardwareIo {
        /// What the link reported.
        message: String,
    },

    /// The double buffer did not swap within the poll bound.
    #[error("Timed out after {waited:?} waiting for a swap on '{register}'")]
    Timeout {
        /// Time spent polling.
        waited: Duration,
        /// Status register that never changed.
        register: String,
    },

    /// Sample or waveform dimensions do not fit the operation.
    #[error("Data shape error: {message}")]
    DataShape {
        /// Which dimensions disagreed.
        message: String,
    },

    /// A frame was dropped between two reads.
    #[error("Frame gap: expected swap {expected}, observed swap {observed}")]
    FrameGap {
        /// Swap count the next frame should have carried.
        expected: u32,
        /// Swap count it carried.
        observed: u32,
    },

    /// Two tones read at the same time share an FFT bin.
    #[error("FFT bin {bin} is assigned twice in batch {batch}")]
    BinCollision {
        /// Batch holding the colliding tones.
        batch: usize,
        /// Shared FFT bin.
        bin: usize,
    },

    /// The resonator fit oracle could not produce a center frequency.
    #[error("Resonator fit failed: {message}")]
    FitFailed {
        /// Reason given by the fitter.
        message: String,
    },

    /// Required data is missing from a persisted container.
    #[error("Store error: {message}")]
    Store {
        /// Missing or malformed field.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration or request value is out of range.
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON store.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReadoutError {
    pub(crate) fn hardware(message: impl Into<String>) -> Self {
        Self::HardwareIo {
            message: message.into(),
        }
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::DataShape {
            message: message.into(),
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Check if retrying the same step can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::HardwareIo { .. } | Self::Timeout { .. } | Self::FrameGap { .. }
        )
    }

    /// Check if this is a stalled-link timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<figment::Error> for ReadoutError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// A buffer read that stopped before the requested frame count.
///
/// The frames captured before the failure are kept so the caller can decide between
/// retrying the step and using what arrived.
#[derive(Error, Debug)]
#[error("acquisition stopped after {} of {requested} frames: {source}", .frames.len())]
pub struct AcquisitionError {
    /// Frames read before the failure, in capture order.
    pub frames: Vec<Frame>,
    /// Number of frames that were requested.
    pub requested: usize,
    /// Timing of the partial read.
    pub stats: CaptureStats,
    /// What stopped the read.
    #[source]
    pub source: ReadoutError,
}

impl AcquisitionError {
    /// Every acquisition failure is recoverable by retry at the step level.
    pub fn is_recoverable(&self) -> bool {
        self.source.is_recoverable()
    }
}

impl From<AcquisitionError> for ReadoutError {
    fn from(err: AcquisitionError) -> Self {
        err.source
    }
}

/// Low-confidence conditions that let processing continue with a documented default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationWarning {
    /// No wave normalization stored; samples were scaled by 1.0.
    MissingWaveNormalization {
        /// Group missing the field.
        group: String,
    },
    /// No simultaneous tone count stored; one tone was assumed.
    MissingToneCount,
    /// No sweep index stored for a time-stream group.
    MissingSweepIndex {
        /// Group missing the field.
        group: String,
    },
    /// An optional field was absent and replaced by its default.
    MissingField {
        /// Group missing the field.
        group: String,
        /// Field name.
        field: String,
    },
}

impl fmt::Display for CalibrationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingWaveNormalization { group } => write!(
                f,
                "wave normalization not found in '{group}', time series will not match sweep"
            ),
            Self::MissingToneCount => write!(
                f,
                "tone count not found, assuming 1; the effective power level may be wrong"
            ),
            Self::MissingSweepIndex { group } => {
                write!(f, "sweep index not found in '{group}'")
            }
            Self::MissingField { group, field } => {
                write!(f, "field '{field}' not found in '{group}', using default")
            }
        }
    }
}
