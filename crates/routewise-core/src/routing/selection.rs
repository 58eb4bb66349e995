//! Candidate selection over a ranked list

use super::types::RankedCandidate;
use crate::random::RandomSource;

/// How many leading candidates exploration picks from
pub const EXPLORATION_POOL: usize = 3;

/// Sort descending by score; equal scores keep input order and NaN sorts last
pub fn sort_ranked(ranked: &mut [RankedCandidate]) {
    ranked.sort_by(|a, b| sort_key(b.score).total_cmp(&sort_key(a.score)));
}

fn sort_key(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        // folds -0.0 into 0.0
        score + 0.0
    }
}

/// Uniform index into the top of the list
pub fn uniform_top_index(len: usize, rng: &mut dyn RandomSource) -> usize {
    let pool = len.min(EXPLORATION_POOL);
    if pool == 0 {
        return 0;
    }
    ((rng.next_f64() * pool as f64) as usize).min(pool - 1)
}

/// Epsilon-greedy pick: with probability `epsilon` a uniform choice among
/// the top three, otherwise rank 1. Returns `(index, explored)`.
pub fn epsilon_greedy(len: usize, epsilon: f64, rng: &mut dyn RandomSource) -> Option<(usize, bool)> {
    if len == 0 {
        return None;
    }
    if rng.next_f64() < epsilon {
        let index = uniform_top_index(len, rng);
        Some((index, index != 0))
    } else {
        Some((0, false))
    }
}
