//! Deterministic Bernstein (djb2) hasher.
//!
//! Cache keys must be stable across process invocations, so `DefaultHasher`
//! with its random seed is not an option. djb2 is the accumulator the pixel
//! cache keys are specified in terms of: `h = h * 33 + byte`, seeded with 5381.

use std::hash::Hasher;

pub const DJB2_SEED: u64 = 5381;

#[derive(Debug, Clone, Copy)]
pub struct Djb2Hasher(u64);

impl Djb2Hasher {
    pub fn new() -> Self {
        Self(DJB2_SEED)
    }

    /// Continue accumulating on top of a previously finished hash.
    pub fn with_seed(seed: u64) -> Self {
        Self(seed)
    }

    /// Hashes `bytes` on top of `seed` in one call.
    pub fn hash_bytes(seed: u64, bytes: &[u8]) -> u64 {
        let mut hasher = Self::with_seed(seed);
        hasher.write(bytes);
        hasher.finish()
    }
}

impl Default for Djb2Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Djb2Hasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.wrapping_mul(33).wrapping_add(b as u64);
        }
    }
}
