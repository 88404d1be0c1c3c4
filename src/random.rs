//! Thread-local uniform random source.
//!
//! Each thread owns an independent SplitMix64 state, so drawing random bits
//! never touches shared memory on the hot path. The only cross-thread
//! traffic is a single fetch-add when a thread draws for the first time,
//! to hand it a distinct stream.
//!
//! The quality bar here is modest: the skip list consumes individual bits
//! to flip P = 0.5 coins for tower heights, and SplitMix64 passes far
//! stronger tests than that.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Weyl-sequence increment from the SplitMix64 reference.
const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// Streams are spaced by seeding each thread at a different multiple of an
/// odd constant, then scrambling.
static NEXT_STREAM: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static STATE: Cell<u64> = Cell::new(seed());
}

fn seed() -> u64 {
    let stream = NEXT_STREAM.fetch_add(1, Ordering::Relaxed);
    // Scramble the stream index so that consecutive threads do not start
    // in nearby regions of the sequence.
    scramble(stream.wrapping_mul(0xbf58_476d_1ce4_e5b9) ^ GOLDEN_GAMMA)
}

#[inline]
fn scramble(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Draw the calling thread's next 64 uniform bits.
#[inline]
pub(crate) fn next_u64() -> u64 {
    STATE.with(|state| {
        let next = state.get().wrapping_add(GOLDEN_GAMMA);
        state.set(next);
        scramble(next)
    })
}
