//! FIR low-pass filtering for block statistics.
//!
//! `lowpass_taps` designs a Hamming-windowed sinc filter normalized to unit DC gain;
//! `fft_filter` applies it by FFT convolution (`rustfft`), returning the causal output with
//! the same length as the input. The first `taps.len() - 1` outputs contain the filter's
//! warm-up transient.

use num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Design a low-pass FIR filter.
///
/// * `ntaps` - filter length
/// * `cutoff` - cutoff as a fraction of the Nyquist frequency, in (0, 1]
pub fn lowpass_taps(ntaps: usize, cutoff: f64) -> Vec<f64> {
    if ntaps == 0 {
        return Vec::new();
    }
    let center = (ntaps as f64 - 1.0) / 2.0;
    let mut taps: Vec<f64> = (0..ntaps)
        .map(|n| {
            let x = n as f64 - center;
            let window = if ntaps > 1 {
                0.54 - 0.46 * (2.0 * PI * n as f64 / (ntaps as f64 - 1.0)).cos()
            } else {
                1.0
            };
            cutoff * sinc(cutoff * x) * window
        })
        .collect();
    let gain: f64 = taps.iter().sum();
    if gain != 0.0 {
        for tap in &mut taps {
            *tap /= gain;
        }
    }
    taps
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Filter `data` with `taps`, keeping the first `data.len()` outputs of the convolution.
pub fn fft_filter(taps: &[f64], data: &[Complex<f64>]) -> Vec<Complex<f64>> {
    if data.is_empty() {
        return Vec::new();
    }
    if taps.is_empty() {
        return data.to_vec();
    }
    let size = (data.len() + taps.len() - 1).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(size);
    let inverse = planner.plan_fft_inverse(size);

    let mut signal: Vec<Complex<f64>> = data.to_vec();
    signal.resize(size, Complex::new(0.0, 0.0));
    let mut kernel: Vec<Complex<f64>> = taps.iter().map(|&t| Complex::new(t, 0.0)).collect();
    kernel.resize(size, Complex::new(0.0, 0.0));

    forward.process(&mut signal);
    forward.process(&mut kernel);
    for (s, k) in signal.iter_mut().zip(&kernel) {
        *s *= *k;
    }
    inverse.process(&mut signal);

    let scale = 1.0 / size as f64;
    signal.truncate(data.len());
    for s in &mut signal {
        *s *= scale;
    }
    signal
}
