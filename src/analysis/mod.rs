//! Analysis of completed sweeps.

pub mod consolidator;

pub use consolidator::{
    EstimateSource, ParabolicMinimum, ResonanceConsolidator, ResonanceEstimate, ResonatorFit,
};
