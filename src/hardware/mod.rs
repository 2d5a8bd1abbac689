//! Hardware Abstractions
//!
//! Two seams separate the readout logic from the board:
//!
//! - [`FpgaLink`] - the register/BRAM primitives of the board's network client. The client
//!   itself lives outside this crate; [`mock::MockFpga`] implements it for tests.
//! - [`ReadoutDevice`] - what the sweep sequencer needs from a readout: load a tone bank,
//!   select FFT bins, read frames. [`board::RoachBoard`] implements it over any `FpgaLink`,
//!   [`simulated::SimulatedReadout`] implements it with a resonator model.
//!
//! # Design Philosophy
//!
//! The acquisition path is synchronous. A device is exclusively owned for the duration of a
//! sweep session (`&mut self` everywhere); sharing happens one layer up, behind a mutex in
//! the service surface.

pub mod board;
pub mod mock;
pub mod simulated;

use crate::acquisition::Capture;
use crate::error::{AcquisitionError, Result};
use crate::store::HardwareRecord;
use crate::sweep::ToneBank;

/// Register-level access to the FPGA board.
///
/// Mirrors the primitives of the board's control protocol. Every call may fail with
/// [`crate::error::ReadoutError::HardwareIo`].
pub trait FpgaLink: Send {
    /// Read a 32-bit software register.
    fn read_uint(&mut self, register: &str) -> Result<u32>;

    /// Write a 32-bit software register.
    fn write_int(&mut self, register: &str, value: u32) -> Result<()>;

    /// Read `nbytes` from the start of a block RAM.
    fn read(&mut self, bram: &str, nbytes: usize) -> Result<Vec<u8>>;

    /// Write a block RAM without read-back verification.
    fn blind_write(&mut self, bram: &str, data: &[u8]) -> Result<()>;
}

/// A multiplexed readout the sweep sequencer can drive.
///
/// # Contract
/// - `load_tones` replaces the active waveform bank and returns its wave normalization
/// - `select_bins` chooses which FFT bins are streamed; at most one batch at once
/// - `read_frames` blocks until `nframes` frames arrived or a bounded wait failed
/// - samples of the selected bins are interleaved in selection order
pub trait ReadoutDevice: Send {
    /// ADC sampling frequency in MHz.
    fn sample_rate_mhz(&self) -> f64;

    /// FFT size of the channelizer.
    fn nfft(&self) -> usize;

    /// Length of the DAC tone table.
    fn tone_table_size(&self) -> usize;

    /// Load a tone bank into waveform memory. Returns the wave normalization.
    fn load_tones(&mut self, bank: &ToneBank) -> Result<f64>;

    /// Select the FFT bins streamed by the next reads.
    fn select_bins(&mut self, bins: &[usize]) -> Result<()>;

    /// Read `nframes` frames of the selected bins.
    fn read_frames(&mut self, nframes: usize) -> std::result::Result<Capture, AcquisitionError>;

    /// Attenuator settings and tone count, stamped with `epoch`.
    fn hardware_record(&self, epoch: f64) -> HardwareRecord;
}

impl<D: ReadoutDevice + ?Sized> ReadoutDevice for Box<D> {
    fn sample_rate_mhz(&self) -> f64 {
        (**self).sample_rate_mhz()
    }

    fn nfft(&self) -> usize {
        (**self).nfft()
    }

    fn tone_table_size(&self) -> usize {
        (**self).tone_table_size()
    }

    fn load_tones(&mut self, bank: &ToneBank) -> Result<f64> {
        (**self).load_tones(bank)
    }

    fn select_bins(&mut self, bins: &[usize]) -> Result<()> {
        (**self).select_bins(bins)
    }

    fn read_frames(&mut self, nframes: usize) -> std::result::Result<Capture, AcquisitionError> {
        (**self).read_frames(nframes)
    }

    fn hardware_record(&self, epoch: f64) -> HardwareRecord {
        (**self).hardware_record(epoch)
    }
}
