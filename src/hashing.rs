//! Seeded `ahash` builder for tables whose bucket layout is persisted.
//!
//! Output is stable for one build of the crate only. A different `ahash`
//! version or different target features (AES versus the fallback path) may
//! hash the same key differently, so a region should only be reopened by a
//! binary built the same way as the one that wrote it.

use std::hash::BuildHasher;

use ahash::{AHasher, RandomState};

const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Deterministic hasher builder.
///
/// Bucket placement is stored inside the region, so a table reopened from
/// its bytes must hash every key exactly as the table that wrote it did.
/// That holds across instances and processes of the same build; run
/// `validate` after reopening a region written by anything else.
#[derive(Copy, Clone, Debug, Default)]
pub struct FixedState;

impl BuildHasher for FixedState {
    type Hasher = AHasher;

    #[inline]
    fn build_hasher(&self) -> AHasher {
        RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]).build_hasher()
    }
}
