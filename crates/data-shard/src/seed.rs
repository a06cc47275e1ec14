//! Deterministic seed derivation

use fnv::FnvHasher;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::hash::Hasher;

/// Hash a sequence of integers into one seed.
///
/// Must stay stable across platforms and releases; resumed jobs rely on it.
pub fn derive_seed(parts: &[u64]) -> u64 {
    let mut hasher = FnvHasher::default();
    for part in parts {
        hasher.write_u64(*part);
    }
    hasher.finish()
}

/// ChaCha8 generator seeded from `derive_seed(parts)`
pub fn seeded_rng(parts: &[u64]) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(derive_seed(parts))
}
