//! Resonance consolidation.
//!
//! After every sweep each channel has three candidates for its resonance frequency: the
//! prior guess the sweep was centered on, the center returned by a resonator fit, and the
//! frequency of the deepest measured point. The consolidator picks, in order:
//!
//! 1. the fit, if it lies within `max_deviation` of the guess
//! 2. the raw minimum, if it lies within `max_deviation` of the guess
//! 3. the guess itself
//!
//! A candidate that is missing or NaN never qualifies.

use num_complex::Complex;
use std::fmt;
use tracing::{debug, warn};

use crate::config::ConsolidatorConfig;
use crate::error::{ReadoutError, Result};
use crate::model::{SweepData, Trace};

/// Resonator fit used as an opaque center-frequency oracle.
pub trait ResonatorFit {
    /// Center frequency, in the units of `freqs`, of the resonance in one trace.
    fn fit_center(&self, freqs: &[f64], s21: &[Complex<f64>]) -> Result<f64>;
}

impl<F> ResonatorFit for F
where
    F: Fn(&[f64], &[Complex<f64>]) -> Result<f64>,
{
    fn fit_center(&self, freqs: &[f64], s21: &[Complex<f64>]) -> Result<f64> {
        self(freqs, s21)
    }
}

/// Quick fit: vertex of a parabola through |S21|^2 at the minimum and its two neighbors.
///
/// Good enough for well-sampled, isolated dips.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParabolicMinimum;

impl ResonatorFit for ParabolicMinimum {
    fn fit_center(&self, freqs: &[f64], s21: &[Complex<f64>]) -> Result<f64> {
        let power: Vec<f64> = s21.iter().map(|s| s.norm_sqr()).collect();
        let min = power
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_nan())
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| ReadoutError::FitFailed {
                message: "trace has no valid points".to_string(),
            })?;
        if min == 0 || min + 1 >= power.len() {
            return Err(ReadoutError::FitFailed {
                message: "minimum at the edge of the trace".to_string(),
            });
        }
        let (x0, x1, x2) = (freqs[min - 1], freqs[min], freqs[min + 1]);
        let (y0, y1, y2) = (power[min - 1], power[min], power[min + 1]);
        let denom = (x0 - x1) * (x0 - x2) * (x1 - x2);
        let a = (x2 * (y1 - y0) + x1 * (y0 - y2) + x0 * (y2 - y1)) / denom;
        let b = (x2 * x2 * (y0 - y1) + x1 * x1 * (y2 - y0) + x0 * x0 * (y1 - y2)) / denom;
        if a.is_nan() || a <= 0.0 {
            return Err(ReadoutError::FitFailed {
                message: "trace is not convex around its minimum".to_string(),
            });
        }
        Ok(-b / (2.0 * a))
    }
}

/// Which candidate became the next estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateSource {
    /// The resonator fit.
    Fit,
    /// The deepest measured point.
    RawMinimum,
    /// The prior guess, both other candidates being untrusted.
    PriorGuess,
}

impl fmt::Display for EstimateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fit => write!(f, "fit"),
            Self::RawMinimum => write!(f, "raw minimum"),
            Self::PriorGuess => write!(f, "prior guess"),
        }
    }
}

/// Candidates and decision for one channel over one sweep iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResonanceEstimate {
    /// Channel the estimate belongs to.
    pub channel_id: usize,
    /// Frequency the sweep was centered on.
    pub guess: f64,
    /// Fitted center, if the fit succeeded.
    pub fit: Option<f64>,
    /// Frequency of the smallest |S21|, if the trace had points.
    pub raw_min: Option<f64>,
    /// Next estimate.
    pub chosen: f64,
    /// Where `chosen` came from.
    pub source: EstimateSource,
    /// Measured frequency closest to `chosen`, when refined against a sweep.
    pub nearest_measured: Option<f64>,
}

/// Arbitrates between fit, raw minimum and prior guess.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResonanceConsolidator {
    max_deviation: f64,
}

impl Default for ResonanceConsolidator {
    fn default() -> Self {
        Self::from(&ConsolidatorConfig::default())
    }
}

impl From<&ConsolidatorConfig> for ResonanceConsolidator {
    fn from(config: &ConsolidatorConfig) -> Self {
        Self::new(config.max_deviation)
    }
}

impl ResonanceConsolidator {
    /// Create a consolidator accepting candidates within `max_deviation` of the guess.
    pub fn new(max_deviation: f64) -> Self {
        Self { max_deviation }
    }

    /// Largest accepted distance from the guess.
    pub fn max_deviation(&self) -> f64 {
        self.max_deviation
    }

    fn trusted(&self, guess: f64, candidate: Option<f64>) -> Option<f64> {
        candidate.filter(|value| (value - guess).abs() <= self.max_deviation)
    }

    /// Pick the next estimate from the three candidates.
    pub fn choose(&self, guess: f64, fit: Option<f64>, raw_min: Option<f64>) -> (f64, EstimateSource) {
        if let Some(fit) = self.trusted(guess, fit) {
            (fit, EstimateSource::Fit)
        } else if let Some(min) = self.trusted(guess, raw_min) {
            (min, EstimateSource::RawMinimum)
        } else {
            (guess, EstimateSource::PriorGuess)
        }
    }

    /// Fit one channel's trace and pick its next estimate.
    pub fn consolidate<F: ResonatorFit + ?Sized>(
        &self,
        channel_id: usize,
        guess: f64,
        trace: &Trace,
        fitter: &F,
    ) -> ResonanceEstimate {
        let fit = if trace.is_empty() {
            None
        } else {
            match fitter.fit_center(&trace.freqs, &trace.s21) {
                Ok(center) => Some(center),
                Err(error) => {
                    warn!(channel_id, %error, "resonator fit failed");
                    None
                }
            }
        };
        let raw_min = trace.min_magnitude_frequency();
        let (chosen, source) = self.choose(guess, fit, raw_min);
        debug!(channel_id, guess, ?fit, ?raw_min, chosen, %source, "consolidated");
        ResonanceEstimate {
            channel_id,
            guess,
            fit,
            raw_min,
            chosen,
            source,
            nearest_measured: None,
        }
    }

    /// Refine every channel of a sweep.
    ///
    /// `guesses` are the targets the sweep was planned from, in any order. Channel ids are
    /// positions in the sorted target list, so the guesses are sorted the same way to find
    /// each one's trace; estimates come back in the order of `guesses`. Each estimate also
    /// records the measured frequency nearest to its choice.
    pub fn refine<F: ResonatorFit + ?Sized>(
        &self,
        sweep: &SweepData,
        guesses: &[f64],
        fitter: &F,
    ) -> Vec<ResonanceEstimate> {
        let mut order: Vec<usize> = (0..guesses.len()).collect();
        order.sort_by(|a, b| guesses[*a].total_cmp(&guesses[*b]));

        let mut estimates: Vec<Option<ResonanceEstimate>> = vec![None; guesses.len()];
        for (channel_id, position) in order.into_iter().enumerate() {
            let trace = sweep.select_by_channel(channel_id);
            let mut estimate = self.consolidate(channel_id, guesses[position], &trace, fitter);
            estimate.nearest_measured = sweep
                .nearest_block(estimate.chosen)
                .map(|block| block.frequency());
            estimates[position] = Some(estimate);
        }
        estimates.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_fit_wins() {
        let c = ResonanceConsolidator::default();
        assert_eq!(c.choose(100.0, Some(100.05), Some(99.5)), (100.05, EstimateSource::Fit));
    }

    #[test]
    fn raw_minimum_when_fit_diverges() {
        let c = ResonanceConsolidator::default();
        assert_eq!(
            c.choose(100.0, Some(105.0), Some(100.05)),
            (100.05, EstimateSource::RawMinimum)
        );
    }

    #[test]
    fn guess_when_both_untrusted() {
        let c = ResonanceConsolidator::default();
        assert_eq!(
            c.choose(100.0, Some(105.0), Some(105.0)),
            (100.0, EstimateSource::PriorGuess)
        );
        assert_eq!(c.choose(100.0, None, None), (100.0, EstimateSource::PriorGuess));
        assert_eq!(
            c.choose(100.0, Some(f64::NAN), None),
            (100.0, EstimateSource::PriorGuess)
        );
    }

    #[test]
    fn threshold_is_configurable() {
        let c = ResonanceConsolidator::new(10.0);
        assert_eq!(c.choose(100.0, Some(105.0), None).1, EstimateSource::Fit);
    }

    #[test]
    fn parabolic_minimum_finds_vertex() {
        let freqs: Vec<f64> = (0..11).map(|i| 99.5 + 0.1 * f64::from(i)).collect();
        let s21: Vec<Complex<f64>> = freqs
            .iter()
            .map(|f| Complex::new(0.1 + (f - 100.02).powi(2), 0.0).sqrt())
            .collect();
        let center = ParabolicMinimum.fit_center(&freqs, &s21).unwrap();
        assert!((center - 100.02).abs() < 1e-6);
    }

    #[test]
    fn failing_fit_falls_back_to_minimum() {
        let trace = Trace {
            freqs: vec![99.9, 100.0, 100.1],
            s21: vec![Complex::new(1.0, 0.0), Complex::new(0.2, 0.0), Complex::new(0.9, 0.0)],
            errors: vec![0.0; 3],
        };
        let failing = |_: &[f64], _: &[Complex<f64>]| -> Result<f64> {
            Err(ReadoutError::FitFailed {
                message: "diverged".to_string(),
            })
        };
        let estimate = ResonanceConsolidator::default().consolidate(0, 100.02, &trace, &failing);
        assert_eq!(estimate.fit, None);
        assert_eq!(estimate.source, EstimateSource::RawMinimum);
        assert_eq!(estimate.chosen, 100.0);
    }
}
