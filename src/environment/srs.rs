//! SRS thermometer log files.
//!
//! The logger wrote three line layouts over its lifetime, all space separated:
//!
//! ```text
//! 15 fields:  <stamp>[,] ... field 11 is the temperature (trailing comma allowed)
//! >9 fields:  <stamp> ... field 9 is the temperature
//! otherwise:  <sensor> <resistance> <temperature> <stamp>
//! ```
//!
//! Stamps are local time, `%Y%m%d-%H%M%S`. Lines that do not parse are skipped.

use chrono::{Local, NaiveDateTime, TimeZone};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use super::temperature::{TemperatureSeries, TemperatureSource};
use crate::config::TemperatureConfig;
use crate::error::{ReadoutError, Result};

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Sensor used when the selected one yields nothing in a file.
pub const FALLBACK_SENSOR: u32 = 1;

fn parse_stamp(text: &str) -> Option<f64> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), STAMP_FORMAT).ok()?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(local.timestamp() as f64)
}

/// Parse one log line into `(epoch, temperature)`.
pub fn parse_line(line: &str, sensor: u32) -> Option<(f64, f64)> {
    let parts: Vec<&str> = line.trim_end().split(' ').collect();
    if parts.len() == 15 {
        let time = parse_stamp(parts[0].trim().trim_end_matches(','))?;
        let temp = parts[11].trim().trim_matches(',').parse().ok()?;
        return Some((time, temp));
    }
    if parts.len() > 9 {
        let time = parse_stamp(parts[0])?;
        let temp = parts[9].trim().parse().ok()?;
        return Some((time, temp));
    }
    if parts[0].trim().parse::<u32>().ok()? != sensor || parts.len() < 4 {
        return None;
    }
    let temp = parts[2].trim().parse().ok()?;
    let time = parse_stamp(parts[3])?;
    Some((time, temp))
}

/// Parse every line of one log with the given sensor.
pub fn parse_log(text: &str, sensor: u32) -> Vec<(f64, f64)> {
    text.lines().filter_map(|line| parse_line(line, sensor)).collect()
}

/// Temperature source reading every log file of a directory.
///
/// Log files are the `*.txt` files whose name starts with a year (`20...`), read in name
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct SrsLogSource {
    dir: PathBuf,
    sensor: u32,
}

impl SrsLogSource {
    /// Source for `dir`, extracting `sensor`.
    pub fn new(dir: impl Into<PathBuf>, sensor: u32) -> Self {
        Self {
            dir: dir.into(),
            sensor,
        }
    }

    /// Source described by the configuration, if a log directory is set.
    pub fn from_config(config: &TemperatureConfig) -> Option<Self> {
        config
            .log_dir
            .as_ref()
            .map(|dir| Self::new(dir, config.sensor))
    }

    /// Log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_log = path.extension().is_some_and(|ext| ext == "txt")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("20"));
            if is_log {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Readings of one file, falling back to sensor 1 when the selected sensor has none.
    pub fn read_file(&self, path: &Path) -> Result<Vec<(f64, f64)>> {
        let text = fs::read_to_string(path).map_err(|err| {
            ReadoutError::store(format!("cannot read {}: {err}", path.display()))
        })?;
        let readings = parse_log(&text, self.sensor);
        if readings.is_empty() && self.sensor != FALLBACK_SENSOR {
            debug!(file = %path.display(), "no readings for sensor, trying fallback");
            return Ok(parse_log(&text, FALLBACK_SENSOR));
        }
        Ok(readings)
    }
}

impl TemperatureSource for SrsLogSource {
    #[instrument(skip(self), fields(dir = %self.dir.display(), sensor = self.sensor))]
    fn load(&self) -> Result<TemperatureSeries> {
        let mut readings = Vec::new();
        for file in self.log_files()? {
            readings.extend(self.read_file(&file)?);
        }
        debug!(readings = readings.len(), "temperature logs parsed");
        Ok(TemperatureSeries::from_readings(readings))
    }
}
