//! Deterministic RNG wrapper and seed-derivation helpers.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Deterministic RNG handle used by every random draw in the pipeline.
///
/// Contexts (baseline, each ablation range, synthetic mocks, calibration) get
/// their own base seed, derived by hashing `(master_seed, context_id)` with
/// SipHash-1-3 under fixed zero keys. Within a context, draw `i` is seeded
/// with `base + i` so any single draw can be replayed in isolation.
#[derive(Debug, Clone)]
pub struct RngHandle {
    rng: StdRng,
}

impl RngHandle {
    /// Creates a new RNG handle from a seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Creates the handle for a single draw of a context.
    pub fn for_draw(base_seed: u64, draw_index: usize) -> Self {
        Self::from_seed(draw_seed(base_seed, draw_index))
    }
}

impl RngCore for RngHandle {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Derives the deterministic base seed for a specific substream.
pub fn derive_substream_seed(master_seed: u64, substream: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write_u64(substream);
    hasher.finish()
}

/// Seed used for draw `draw_index` of a context seeded with `base_seed`.
pub fn draw_seed(base_seed: u64, draw_index: usize) -> u64 {
    base_seed.wrapping_add(draw_index as u64)
}
