//! Cached temperature lookups.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sweep::epoch_seconds;

/// Source of "now" for cache expiry, in seconds since the UNIX epoch.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        epoch_seconds()
    }
}

/// Hand-driven clock; clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock stopped at `now`.
    pub fn new(now: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(now.to_bits())),
        }
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.set(self.now() + by.as_secs_f64());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Time-ordered temperature readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureSeries {
    /// Reading times, seconds since the UNIX epoch, ascending.
    pub times: Vec<f64>,
    /// Temperatures, parallel to `times`.
    pub temps: Vec<f64>,
}

impl TemperatureSeries {
    /// Build a series from unordered readings; NaN readings are dropped.
    pub fn from_readings(readings: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut readings: Vec<(f64, f64)> = readings
            .into_iter()
            .filter(|(t, v)| !t.is_nan() && !v.is_nan())
            .collect();
        readings.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            times: readings.iter().map(|r| r.0).collect(),
            temps: readings.iter().map(|r| r.1).collect(),
        }
    }

    /// Number of readings.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True when there are no readings.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Linear interpolation at `epoch`, clamped to the first and last readings.
    ///
    /// 0.0 for an empty series.
    pub fn interpolate(&self, epoch: f64) -> f64 {
        let (Some(first), Some(last)) = (self.times.first(), self.times.last()) else {
            return 0.0;
        };
        if epoch <= *first {
            return self.temps[0];
        }
        if epoch >= *last {
            return self.temps[self.temps.len() - 1];
        }
        let upper = self.times.partition_point(|t| *t <= epoch);
        let (t0, t1) = (self.times[upper - 1], self.times[upper]);
        let (v0, v1) = (self.temps[upper - 1], self.temps[upper]);
        if t1 == t0 {
            return v0;
        }
        v0 + (v1 - v0) * (epoch - t0) / (t1 - t0)
    }
}

/// Where temperature readings come from.
pub trait TemperatureSource: Send {
    /// Load every available reading.
    fn load(&self) -> Result<TemperatureSeries>;
}

impl<F> TemperatureSource for F
where
    F: Fn() -> Result<TemperatureSeries> + Send,
{
    fn load(&self) -> Result<TemperatureSeries> {
        self()
    }
}

/// Temperature lookups over a source that is re-read at most once per refresh interval.
///
/// A failed reload keeps the previous readings and is retried on the next lookup.
#[derive(Debug)]
pub struct TemperatureCache<S, C = SystemClock> {
    source: S,
    clock: C,
    refresh: Duration,
    series: TemperatureSeries,
    last_update: Option<f64>,
}

impl<S: TemperatureSource> TemperatureCache<S, SystemClock> {
    /// Cache on the wall clock.
    pub fn new(source: S, refresh: Duration) -> Self {
        Self::with_clock(source, SystemClock, refresh)
    }
}

impl<S: TemperatureSource, C: Clock> TemperatureCache<S, C> {
    /// Cache on an explicit clock.
    pub fn with_clock(source: S, clock: C, refresh: Duration) -> Self {
        Self {
            source,
            clock,
            refresh,
            series: TemperatureSeries::default(),
            last_update: None,
        }
    }

    /// Refresh interval.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh
    }

    /// Readings currently cached.
    pub fn series(&self) -> &TemperatureSeries {
        &self.series
    }

    fn is_stale(&self, now: f64) -> bool {
        self.last_update
            .map_or(true, |last| now - last > self.refresh.as_secs_f64())
    }

    /// Reload the source now.
    pub fn reload(&mut self) -> Result<()> {
        let series = self.source.load()?;
        debug!(readings = series.len(), "temperature cache updated");
        self.series = series;
        self.last_update = Some(self.clock.now());
        Ok(())
    }

    /// Temperature at `epoch`, reloading the source first when the cache expired.
    pub fn temperature_at(&mut self, epoch: f64) -> f64 {
        if self.is_stale(self.clock.now()) {
            if let Err(error) = self.reload() {
                warn!(%error, "temperature reload failed, using cached readings");
            }
        }
        self.series.interpolate(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn series() -> TemperatureSeries {
        TemperatureSeries::from_readings([(20.0, 0.3), (10.0, 0.1), (30.0, f64::NAN)])
    }

    #[test]
    fn interpolation_clamps_at_the_ends() {
        let s = series();
        assert_eq!(s.len(), 2);
        assert_eq!(s.interpolate(5.0), 0.1);
        assert!((s.interpolate(15.0) - 0.2).abs() < 1e-12);
        assert_eq!(s.interpolate(25.0), 0.3);
        assert_eq!(TemperatureSeries::default().interpolate(15.0), 0.0);
    }

    #[test]
    fn cache_reloads_after_interval() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let source = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(series())
        };
        let clock = ManualClock::new(1000.0);
        let mut cache = TemperatureCache::with_clock(source, clock.clone(), Duration::from_secs(1200));

        assert!((cache.temperature_at(15.0) - 0.2).abs() < 1e-12);
        clock.advance(Duration::from_secs(600));
        cache.temperature_at(15.0);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(601));
        cache.temperature_at(15.0);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_reload_keeps_readings() {
        let fail = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&fail);
        let source = move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(series())
            } else {
                Err(crate::error::ReadoutError::store("log directory vanished"))
            }
        };
        let clock = ManualClock::new(0.0);
        let mut cache = TemperatureCache::with_clock(source, clock.clone(), Duration::from_secs(10));
        assert_eq!(cache.temperature_at(10.0), 0.1);
        clock.advance(Duration::from_secs(11));
        assert_eq!(cache.temperature_at(20.0), 0.3);
        assert_eq!(cache.series().len(), 2);
    }
}
