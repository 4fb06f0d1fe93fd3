//! Coarse monotonic kernel time.
//!
//! A single tick counter advanced by the platform's timer interrupt. The
//! buffer cache stamps buffers with it for LRU ordering; nothing here needs
//! finer granularity than "which of two events came first, roughly".
//!
//! Ticks are not unique: two buffers released within the same tick compare
//! equal and are evicted in bucket-scan order. Consumers compare stamps, they
//! never require distinctness.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the clock by one tick. Called by the timer interrupt path.
/// Returns the new tick value.
#[inline]
pub fn clock_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Current tick count. Monotonic, coarse.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
