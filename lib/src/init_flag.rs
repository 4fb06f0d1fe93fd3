//! One-shot initialization latches.

use core::sync::atomic::{AtomicBool, Ordering};

/// A sticky boolean for "has this subsystem been brought up yet" checks.
pub struct InitFlag(AtomicBool);

impl InitFlag {
    #[inline]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Set the flag, returning `true` only for the caller that performed the
    /// transition. Use this to detect double initialization.
    #[inline]
    pub fn init_once(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_set(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}
