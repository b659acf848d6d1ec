//! Noise helpers for the simulated drivers used off-target.

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
#[cfg(feature = "sim")]
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Without the `sim` feature there is no RNG; readings sit on the mean.
#[cfg(not(feature = "sim"))]
fn approx_std_normal() -> f64 {
    0.0
}

/// Sample from N(mean, sigma).
pub(crate) fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Gaussian sample clamped to a physically plausible range.
pub(crate) fn bounded(mean: f64, sigma: f64, min: f64, max: f64) -> f64 {
    gaussian(mean, sigma).clamp(min, max)
}
