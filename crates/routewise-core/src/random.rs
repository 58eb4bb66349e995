//! Injectable randomness
//!
//! Every stochastic decision in the rankers (epsilon-greedy exploration,
//! posterior sampling) draws from a [`RandomSource`]. Production code uses
//! [`SeededRandom::from_entropy`]; tests pin a seed and get identical draw
//! sequences on every platform, because the generator is ChaCha8 rather than
//! the version-dependent `StdRng`.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Uniform random generator used by all rankers
pub trait RandomSource: Send {
    /// Draw a uniform value in `[0, 1)`
    fn next_f64(&mut self) -> f64;
}

/// ChaCha8-backed random source
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: ChaCha8Rng,
}

impl SeededRandom {
    /// Create a generator with a fixed seed (for reproducibility in tests)
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Create a generator seeded from the operating system
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_entropy(),
        }
    }
}

impl Default for SeededRandom {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }
}

/// Replays a fixed list of draws, cycling when exhausted
///
/// Lets tests force exploration (`0.0`) or exploitation (`0.99`) exactly.
#[derive(Debug, Clone)]
pub struct FixedSequence {
    values: Vec<f64>,
    cursor: usize,
}

impl FixedSequence {
    pub fn new(values: Vec<f64>) -> Self {
        let values = if values.is_empty() { vec![0.5] } else { values };
        Self { values, cursor: 0 }
    }
}

impl RandomSource for FixedSequence {
    fn next_f64(&mut self) -> f64 {
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        value.clamp(0.0, 1.0 - f64::EPSILON)
    }
}
