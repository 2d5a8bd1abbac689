//! Environmental lookups recorded alongside measurements.
//!
//! - [`temperature`] - interpolating temperature cache with an explicit clock and refresh
//!   interval
//! - [`srs`] - SRS thermometer log parsing

pub mod srs;
pub mod temperature;

pub use srs::SrsLogSource;
pub use temperature::{
    Clock, ManualClock, SystemClock, TemperatureCache, TemperatureSeries, TemperatureSource,
};

use crate::config::TemperatureConfig;

/// Wall-clock cache over the configured SRS log directory, if one is set.
pub fn temperature_cache(config: &TemperatureConfig) -> Option<TemperatureCache<SrsLogSource>> {
    SrsLogSource::from_config(config).map(|source| TemperatureCache::new(source, config.refresh()))
}
