//! Deterministic random number generator
//!
//! Xorshift PRNG threaded explicitly through weight initialisation and
//! minibatch sampling. The same seed reproduces the same weights and the same
//! sampled indices.

use std::time::{SystemTime, UNIX_EPOCH};

const FALLBACK_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Xorshift64 generator.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a generator with an explicit seed (zero maps to a fixed constant).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { FALLBACK_SEED } else { seed };
        Self { state }
    }

    /// Seeded from the wall clock, for runs without a configured seed.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::new(nanos)
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Uniform in [0, 1). Uses the top 24 bits so the result is exactly
    /// representable and never rounds up to 1.0.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Uniform integer in [0, upper); 0 when `upper == 0`.
    pub fn gen_usize(&mut self, upper: usize) -> usize {
        if upper == 0 {
            0
        } else {
            (self.next_u32() as usize) % upper
        }
    }

    /// `count` indices drawn uniformly with replacement from [0, upper).
    pub fn sample_indices(&mut self, count: usize, upper: usize) -> Vec<usize> {
        (0..count).map(|_| self.gen_usize(upper)).collect()
    }
}
