//! ROACH baseband board control over an [`FpgaLink`].
//!
//! Register map:
//!
//! | Register / BRAM   | Use                                                         |
//! |-------------------|-------------------------------------------------------------|
//! | `fftshift`        | FFT stage down-shifts, `(2^20 - 1) - (2^gain - 1)`          |
//! | `chansel`         | single-bin readout select                                   |
//! | `fftbin_select`   | multi-bin readout table, one big-endian u32 per slot        |
//! | `nchans`          | number of active readout slots                              |
//! | `iout` / `qout`   | DAC tone tables, big-endian i16                             |
//! | `dacctrl`         | pulsed 0 then 1 to restart waveform playback                |
//! | `gpioa`           | attenuator serial interface                                 |
//! | `<buffer>_addr`, `<buffer>_a`, `<buffer>_b` | output double buffer              |
//!
//! The attenuators take a 6-bit magnitude (0.5 dB steps) shifted in MSB first: for each
//! bit the data line is set, the clock is pulsed, then the latch enable of the target
//! attenuator is pulsed once.

use tracing::{debug, info, instrument};

use super::{FpgaLink, ReadoutDevice};
use crate::acquisition::{BufferStreamReader, Capture, ReaderConfig};
use crate::config::HardwareConfig;
use crate::error::{AcquisitionError, ReadoutError, Result};
use crate::store::HardwareRecord;
use crate::sweep::{ToneBank, Waveform};

const GPIO_REGISTER: &str = "gpioa";
const DATA_BIT: u32 = 0x08;
const CLOCK_BIT: u32 = 0x04;
/// Latch enable of the ADC-side attenuator.
pub const ADC_LATCH: u32 = 0x02;
/// Latch enable of the DAC-side attenuator.
pub const DAC_LATCH: u32 = 0x01;
/// Largest attenuator setting in dB.
pub const MAX_ATTENUATION_DB: f64 = 31.5;
const FFT_STAGES: u32 = 20;

/// Board geometry.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Double-buffer reader settings.
    pub reader: ReaderConfig,
    /// ADC sampling frequency in MHz.
    pub sample_rate_mhz: f64,
    /// FFT size of the channelizer.
    pub nfft: usize,
    /// Length of the DAC tone table.
    pub tone_table_size: usize,
    /// Pipeline delay of the channel selector, in bins.
    pub bin_offset: usize,
}

impl From<&HardwareConfig> for BoardConfig {
    fn from(hw: &HardwareConfig) -> Self {
        Self {
            reader: ReaderConfig::from(hw),
            sample_rate_mhz: hw.sample_rate_mhz,
            nfft: hw.nfft,
            tone_table_size: hw.tone_table_size,
            bin_offset: 0,
        }
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self::from(&HardwareConfig::default())
    }
}

/// A ROACH board in baseband readout mode.
pub struct RoachBoard<L: FpgaLink> {
    link: L,
    config: BoardConfig,
    reader: BufferStreamReader,
    adc_atten: f64,
    dac_atten: f64,
    ntones: Option<usize>,
}

impl<L: FpgaLink> RoachBoard<L> {
    /// Wrap a link.
    pub fn new(link: L, config: BoardConfig) -> Self {
        let reader = BufferStreamReader::new(config.reader.clone());
        Self {
            link,
            config,
            reader,
            adc_atten: 0.0,
            dac_atten: 0.0,
            ntones: None,
        }
    }

    /// Board settings.
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Give back the link.
    pub fn into_link(self) -> L {
        self.link
    }

    /// Last ADC attenuation set, in dB.
    pub fn adc_attenuation(&self) -> f64 {
        self.adc_atten
    }

    /// Last DAC attenuation set, in dB.
    pub fn dac_attenuation(&self) -> f64 {
        self.dac_atten
    }

    /// Tones in the loaded bank, if one was loaded.
    pub fn ntones(&self) -> Option<usize> {
        self.ntones
    }

    /// Set the FFT gain: `gain` of the 20 stages skip their down-shift.
    pub fn set_fft_gain(&mut self, gain: u32) -> Result<()> {
        if gain > FFT_STAGES {
            return Err(ReadoutError::Validation(format!(
                "FFT gain {gain} exceeds {FFT_STAGES} stages"
            )));
        }
        let all = (1u32 << FFT_STAGES) - 1;
        let fftshift = all - ((1u32 << gain) - 1);
        debug!(gain, fftshift, "setting FFT gain");
        self.link.write_int("fftshift", fftshift)
    }

    /// Stream a single FFT bin.
    pub fn select_bin(&mut self, bin: usize) -> Result<()> {
        let register = self.hardware_bin(bin)?;
        self.link.write_int("chansel", register)
    }

    /// Stream several FFT bins, interleaved in the given order.
    pub fn select_fft_bins(&mut self, bins: &[usize]) -> Result<()> {
        if bins.is_empty() {
            return Err(ReadoutError::shape("no FFT bins selected"));
        }
        let mut table = Vec::with_capacity(bins.len() * 4);
        for bin in bins {
            table.extend_from_slice(&self.hardware_bin(*bin)?.to_be_bytes());
        }
        self.link.blind_write("fftbin_select", &table)?;
        self.link.write_int("nchans", bins.len() as u32)?;
        debug!(?bins, "readout bins selected");
        Ok(())
    }

    fn hardware_bin(&self, bin: usize) -> Result<u32> {
        let nfft = self.config.nfft;
        if bin >= nfft {
            return Err(ReadoutError::shape(format!(
                "FFT bin {bin} outside a {nfft}-point transform"
            )));
        }
        let shifted = (bin + nfft - self.config.bin_offset % nfft) % nfft;
        u32::try_from(shifted).map_err(|_| ReadoutError::shape(format!("FFT bin {bin} too large")))
    }

    /// Upload a tone table and restart playback.
    pub fn load_waveform(&mut self, waveform: &Waveform) -> Result<()> {
        if waveform.len() != self.config.tone_table_size {
            return Err(ReadoutError::shape(format!(
                "waveform should be {} samples long, got {}",
                self.config.tone_table_size,
                waveform.len()
            )));
        }
        let mut iout = Vec::with_capacity(waveform.len() * 2);
        let mut qout = Vec::with_capacity(waveform.len() * 2);
        for word in waveform.to_bytes().chunks_exact(4) {
            iout.extend_from_slice(&word[..2]);
            qout.extend_from_slice(&word[2..]);
        }
        self.link.blind_write("iout", &iout)?;
        self.link.blind_write("qout", &qout)?;
        self.link.write_int("dacctrl", 0)?;
        self.link.write_int("dacctrl", 1)
    }

    /// Shift a 6-bit attenuation into the attenuator selected by `latch`.
    pub fn set_attenuator(&mut self, attenuation_db: f64, latch: u32) -> Result<()> {
        if !(0.0..=MAX_ATTENUATION_DB).contains(&attenuation_db) {
            return Err(ReadoutError::Validation(format!(
                "attenuation {attenuation_db} dB outside 0 to {MAX_ATTENUATION_DB} dB"
            )));
        }
        let code = (attenuation_db * 2.0) as u32;
        self.link.write_int(GPIO_REGISTER, 0)?;
        for bit in (0..6).rev() {
            let data = if code & (1 << bit) != 0 { DATA_BIT } else { 0 };
            self.link.write_int(GPIO_REGISTER, data)?;
            self.link.write_int(GPIO_REGISTER, data | CLOCK_BIT)?;
            self.link.write_int(GPIO_REGISTER, data)?;
        }
        self.link.write_int(GPIO_REGISTER, latch)?;
        self.link.write_int(GPIO_REGISTER, 0)
    }

    /// Set the ADC-side attenuator, 0 to 31.5 dB in 0.5 dB steps.
    pub fn set_adc_attenuator(&mut self, attenuation_db: f64) -> Result<()> {
        self.set_attenuator(attenuation_db, ADC_LATCH)?;
        self.adc_atten = attenuation_db;
        Ok(())
    }

    /// Set the DAC-side attenuator, 0 to 31.5 dB in 0.5 dB steps.
    pub fn set_dac_attenuator(&mut self, attenuation_db: f64) -> Result<()> {
        self.set_attenuator(attenuation_db, DAC_LATCH)?;
        self.dac_atten = attenuation_db;
        Ok(())
    }

    /// Read `nframes` frames from the output double buffer.
    pub fn read_data(&mut self, nframes: usize) -> std::result::Result<Capture, AcquisitionError> {
        self.reader.read_frames(&mut self.link, nframes)
    }
}

impl<L: FpgaLink> ReadoutDevice for RoachBoard<L> {
    fn sample_rate_mhz(&self) -> f64 {
        self.config.sample_rate_mhz
    }

    fn nfft(&self) -> usize {
        self.config.nfft
    }

    fn tone_table_size(&self) -> usize {
        self.config.tone_table_size
    }

    #[instrument(skip(self, bank), fields(tones = bank.tones.len(), offset = bank.offset))]
    fn load_tones(&mut self, bank: &ToneBank) -> Result<f64> {
        let waveform = bank.waveform()?;
        self.load_waveform(&waveform)?;
        self.ntones = Some(bank.tones.len());
        info!(wave_norm = waveform.wave_norm, "tone bank loaded");
        Ok(waveform.wave_norm)
    }

    fn select_bins(&mut self, bins: &[usize]) -> Result<()> {
        match bins {
            [bin] => self.select_bin(*bin),
            _ => self.select_fft_bins(bins),
        }
    }

    fn read_frames(&mut self, nframes: usize) -> std::result::Result<Capture, AcquisitionError> {
        self.read_data(nframes)
    }

    fn hardware_record(&self, epoch: f64) -> HardwareRecord {
        HardwareRecord {
            epoch,
            adc_atten: self.adc_atten,
            dac_atten: self.dac_atten,
            ntones: self.ntones,
        }
    }
}
