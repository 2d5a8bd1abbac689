//! Tracing setup
//!
//! Installs one global `tracing-subscriber` registry with a single `fmt` layer. Events from
//! this crate are filtered at the configured level; everything else is held at `warn` so
//! dependency chatter does not drown the per-step sweep logs. `RUST_LOG`, when set, replaces
//! the filter entirely.
//!
//! # Example
//! ```no_run
//! use kid_readout::{config::ReadoutConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReadoutConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(channels = config.sweep.channels_per_read, "readout configured");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::{LogFormat, ReadoutConfig};
use crate::error::{ReadoutError, Result};

/// Level applied to targets outside this crate.
const DEPENDENCY_LEVEL: &str = "warn";

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level of this crate's events.
    pub level: Level,
    /// Line layout.
    pub format: LogFormat,
    /// Emit span open/close events.
    pub span_events: bool,
    /// Include source file and line.
    pub file_and_line: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Settings at `level`, compact layout.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: LogFormat::Compact,
            span_events: false,
            file_and_line: false,
        }
    }

    /// Settings from the `[application]` section.
    pub fn from_config(config: &ReadoutConfig) -> Result<Self> {
        let app = &config.application;
        let level = Level::from_str(&app.log_level).map_err(|_| {
            ReadoutError::Validation(format!("invalid log level '{}'", app.log_level))
        })?;
        Ok(Self {
            level,
            format: app.log_format,
            span_events: app.log_spans,
            // source locations only when debugging
            file_and_line: level >= Level::DEBUG,
        })
    }

    /// Change the layout.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        format!(
            "{DEPENDENCY_LEVEL},{}={}",
            env!("CARGO_CRATE_NAME"),
            self.level.as_str().to_lowercase()
        )
    }
}

/// Initialize tracing from the readout configuration.
pub fn init_from_config(config: &ReadoutConfig) -> Result<()> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber that is already installed (tests, embedding applications) is left in place.
pub fn init(config: TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .map_err(|e| ReadoutError::Validation(format!("invalid log filter: {e}")))?;

    let spans = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_span_events(spans)
        .with_file(config.file_and_line)
        .with_line_number(config.file_and_line);
    let layer = match config.format {
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_filter(filter).boxed(),
    };

    if let Err(e) = tracing_subscriber::registry().with(layer).try_init() {
        tracing::debug!(%e, "tracing subscriber already installed");
    }
    Ok(())
}
