//! Readout configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/readout.toml` by default)
//! 2. Environment variables (prefixed with `KID_READOUT_`)
//!
//! Every field has a serde default, so an empty file yields a usable configuration for the
//! simulated board.
//!
//! # Example
//! ```no_run
//! use kid_readout::config::ReadoutConfig;
//!
//! let config = ReadoutConfig::load()?;
//! println!("Channels per read: {}", config.sweep.channels_per_read);
//! # Ok::<(), kid_readout::error::ReadoutError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ReadoutError, Result};

/// Top-level readout configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadoutConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Board and double-buffer settings
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Sweep scheduling settings
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Resonance consolidation settings
    #[serde(default)]
    pub consolidator: ConsolidatorConfig,
    /// Persisted store settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Thermometry lookup settings
    #[serde(default)]
    pub temperature: TemperatureConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line layout
    #[serde(default)]
    pub log_format: LogFormat,
    /// Emit span open/close events (sweeps, store loads)
    #[serde(default)]
    pub log_spans: bool,
}

/// Log line layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored, for interactive sessions
    Pretty,
    /// One line per event, for long acquisition runs
    #[default]
    Compact,
    /// Newline-delimited JSON for log collectors
    Json,
}

/// Board configuration: double buffer layout and sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Double buffer name; banks are `<name>_a`/`<name>_b`, status is `<name>_addr`
    #[serde(default = "default_buffer_name")]
    pub buffer_name: String,
    /// Complex samples per frame
    #[serde(default = "default_frame_samples")]
    pub frame_samples: usize,
    /// Bit of the address register that flips on every buffer swap
    #[serde(default = "default_bank_bit")]
    pub bank_bit: u32,
    /// Bound on a single swap poll, in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Stop a read at the first dropped frame; when off, gaps are reported on the capture
    #[serde(default = "default_abort_on_gap")]
    pub abort_on_gap: bool,
    /// ADC sampling frequency in MHz
    #[serde(default = "default_sample_rate")]
    pub sample_rate_mhz: f64,
    /// FFT size of the channelizer
    #[serde(default = "default_nfft")]
    pub nfft: usize,
    /// Length of the DAC tone table
    #[serde(default = "default_tone_table_size")]
    pub tone_table_size: usize,
}

/// Sweep scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Channels read simultaneously (FFT bin capacity per read)
    #[serde(default = "default_channels_per_read")]
    pub channels_per_read: usize,
    /// Frames read per (batch, offset)
    #[serde(default = "default_reads_per_step")]
    pub reads_per_step: usize,
    /// Delay after loading a waveform, in milliseconds
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Delay after selecting bins, in milliseconds
    #[serde(default = "default_batch_settle")]
    pub batch_settle_ms: u64,
    /// Retries of a failed batch read before it is skipped
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Taps of the low-pass filter used for block statistics
    #[serde(default = "default_filter_length")]
    pub filter_length: usize,
}

/// Resonance consolidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatorConfig {
    /// Largest accepted distance from the prior guess, in MHz
    #[serde(default = "default_max_deviation")]
    pub max_deviation: f64,
}

/// Persisted store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for data files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Thermometry lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureConfig {
    /// Directory holding SRS logger files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Sensor column to extract
    #[serde(default = "default_sensor")]
    pub sensor: u32,
    /// Cache refresh interval in seconds
    #[serde(default = "default_refresh")]
    pub refresh_secs: u64,
}

// Default value functions
fn default_name() -> String {
    "kid-readout".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_name() -> String {
    "ppout0".to_string()
}

fn default_frame_samples() -> usize {
    4096
}

fn default_bank_bit() -> u32 {
    12
}

fn default_poll_timeout() -> u64 {
    2000
}

fn default_abort_on_gap() -> bool {
    true
}

fn default_sample_rate() -> f64 {
    512.0
}

fn default_nfft() -> usize {
    1 << 14
}

fn default_tone_table_size() -> usize {
    1 << 16
}

fn default_channels_per_read() -> usize {
    4
}

fn default_reads_per_step() -> usize {
    8
}

fn default_settle() -> u64 {
    1000
}

fn default_batch_settle() -> u64 {
    200
}

fn default_max_retries() -> usize {
    2
}

fn default_filter_length() -> usize {
    256
}

fn default_max_deviation() -> f64 {
    0.1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_sensor() -> u32 {
    2
}

fn default_refresh() -> u64 {
    20 * 60
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_spans: false,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            buffer_name: default_buffer_name(),
            frame_samples: default_frame_samples(),
            bank_bit: default_bank_bit(),
            poll_timeout_ms: default_poll_timeout(),
            abort_on_gap: default_abort_on_gap(),
            sample_rate_mhz: default_sample_rate(),
            nfft: default_nfft(),
            tone_table_size: default_tone_table_size(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            channels_per_read: default_channels_per_read(),
            reads_per_step: default_reads_per_step(),
            settle_ms: default_settle(),
            batch_settle_ms: default_batch_settle(),
            max_retries: default_max_retries(),
            filter_length: default_filter_length(),
        }
    }
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            max_deviation: default_max_deviation(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            sensor: default_sensor(),
            refresh_secs: default_refresh(),
        }
    }
}

impl HardwareConfig {
    /// Poll bound as a `Duration`
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl SweepConfig {
    /// Waveform settle delay as a `Duration`
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Bin-selection settle delay as a `Duration`
    pub fn batch_settle(&self) -> Duration {
        Duration::from_millis(self.batch_settle_ms)
    }
}

impl TemperatureConfig {
    /// Cache refresh interval as a `Duration`
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

impl ReadoutConfig {
    /// Load configuration from config/readout.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix KID_READOUT_
    /// Example: KID_READOUT_SWEEP__CHANNELS_PER_READ=8
    pub fn load() -> Result<Self> {
        Self::load_from("config/readout.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KID_READOUT_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML, in the layout `load_from` reads.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ReadoutError::Validation(format!("cannot render config: {e}")))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ReadoutError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let hw = &self.hardware;
        if hw.frame_samples == 0 {
            return Err(ReadoutError::Validation(
                "frame_samples must be positive".to_string(),
            ));
        }
        if hw.bank_bit >= 32 {
            return Err(ReadoutError::Validation(format!(
                "Invalid bank_bit {}. Must be 0-31",
                hw.bank_bit
            )));
        }
        if hw.sample_rate_mhz.is_nan() || hw.sample_rate_mhz <= 0.0 {
            return Err(ReadoutError::Validation(format!(
                "Invalid sample_rate_mhz {}",
                hw.sample_rate_mhz
            )));
        }
        if hw.nfft == 0 || hw.tone_table_size < hw.nfft {
            return Err(ReadoutError::Validation(format!(
                "tone_table_size {} must be at least nfft {}",
                hw.tone_table_size, hw.nfft
            )));
        }

        if self.sweep.channels_per_read == 0 {
            return Err(ReadoutError::Validation(
                "channels_per_read must be positive".to_string(),
            ));
        }
        if self.sweep.reads_per_step == 0 {
            return Err(ReadoutError::Validation(
                "reads_per_step must be positive".to_string(),
            ));
        }
        let per_channel = self.sweep.reads_per_step * hw.frame_samples
            / self.sweep.channels_per_read;
        if per_channel <= self.sweep.filter_length {
            return Err(ReadoutError::Validation(format!(
                "{} samples per channel do not cover the {}-tap filter warm-up",
                per_channel, self.sweep.filter_length
            )));
        }

        if self.consolidator.max_deviation.is_nan() || self.consolidator.max_deviation < 0.0 {
            return Err(ReadoutError::Validation(format!(
                "Invalid max_deviation {}",
                self.consolidator.max_deviation
            )));
        }

        Ok(())
    }
}
