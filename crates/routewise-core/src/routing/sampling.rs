//! Posterior sampling primitives for Thompson sampling
//!
//! Every function here returns a finite value for any finite input: zero
//! shapes, zero variances and adversarial random draws all map to in-domain
//! results instead of `NaN`.

use std::f64::consts::PI;

use crate::random::RandomSource;

/// Smallest shape parameter passed to the Gamma sampler
pub const MIN_SHAPE: f64 = 0.001;
/// Above this shape the Beta is replaced by its normal approximation
pub const NORMAL_APPROX_SHAPE: f64 = 100.0;

const MAX_ZERO_REJECTIONS: usize = 16;
const MAX_GAMMA_ITERATIONS: usize = 1_000;

/// Uniform draw in `(0, 1)`, rejecting exact zeros
fn nonzero_uniform(rng: &mut dyn RandomSource) -> f64 {
    for _ in 0..MAX_ZERO_REJECTIONS {
        let u = rng.next_f64();
        if u > 0.0 {
            return u;
        }
    }
    f64::MIN_POSITIVE
}

/// Standard normal draw via the Box-Muller transform
pub fn sample_standard_normal(rng: &mut dyn RandomSource) -> f64 {
    let u1 = nonzero_uniform(rng);
    let u2 = rng.next_f64();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Normal draw with the given mean and variance
pub fn sample_normal(mean: f64, variance: f64, rng: &mut dyn RandomSource) -> f64 {
    let sd = if variance.is_finite() && variance > 0.0 {
        variance.sqrt()
    } else {
        0.0
    };
    let mean = if mean.is_finite() { mean } else { 0.0 };
    mean + sd * sample_standard_normal(rng)
}

/// Gamma(shape, 1) draw using Marsaglia and Tsang's squeeze method
///
/// Shapes below 1 are boosted to `shape + 1` and scaled back by `U^(1/shape)`.
pub fn sample_gamma(shape: f64, rng: &mut dyn RandomSource) -> f64 {
    let shape = if shape.is_finite() {
        shape.max(MIN_SHAPE)
    } else {
        1.0
    };

    if shape < 1.0 {
        let u = nonzero_uniform(rng);
        return sample_gamma(shape + 1.0, rng) * u.powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    for _ in 0..MAX_GAMMA_ITERATIONS {
        let x = sample_standard_normal(rng);
        let v = 1.0 + c * x;
        if v <= 0.0 {
            continue;
        }
        let v = v * v * v;
        let u = rng.next_f64();
        let x2 = x * x;
        if u < 1.0 - 0.0331 * x2 * x2 {
            return d * v;
        }
        if u.ln() < 0.5 * x2 + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
    // Only reachable with a degenerate random source
    d
}

/// Beta(alpha, beta) draw clamped to `[0, 1]`
pub fn sample_beta(alpha: f64, beta: f64, rng: &mut dyn RandomSource) -> f64 {
    let a = if alpha.is_finite() {
        alpha.max(MIN_SHAPE)
    } else {
        1.0
    };
    let b = if beta.is_finite() {
        beta.max(MIN_SHAPE)
    } else {
        1.0
    };

    if a > NORMAL_APPROX_SHAPE || b > NORMAL_APPROX_SHAPE {
        let sum = a + b;
        let mean = a / sum;
        let variance = (a * b) / (sum * sum * (sum + 1.0));
        let draw = sample_normal(mean, variance, rng);
        return finite_unit(draw);
    }

    let x = sample_gamma(a, rng);
    let y = sample_gamma(b, rng);
    let total = x + y;
    if total == 0.0 {
        return 0.5;
    }
    finite_unit(x / total)
}

fn finite_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.5
    }
}
