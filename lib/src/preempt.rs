//! Preemption control.
//!
//! RAII-based preemption guards leveraging Rust's type system for
//! compile-time safety. While at least one [`PreemptGuard`] is alive on a
//! hart, the scheduler must not migrate or preempt the running context; the
//! platform's scheduler enforces this by consulting the per-hart counter.
//!
//! Guards are nestable — preemption re-enables only when the last guard
//! drops. A reschedule requested while preemption was disabled is deferred
//! and delivered through the registered callback when the last guard drops.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::hart::{MAX_HARTS, get_current_hart};
use crate::hart_local::CacheAligned;

struct HartPreemptState {
    count: AtomicU32,
    reschedule_pending: AtomicU32,
}

impl HartPreemptState {
    const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            reschedule_pending: AtomicU32::new(0),
        }
    }
}

static PREEMPT_STATE: [CacheAligned<HartPreemptState>; MAX_HARTS] = {
    const INIT: CacheAligned<HartPreemptState> = CacheAligned(HartPreemptState::new());
    [INIT; MAX_HARTS]
};

static RESCHEDULE_CALLBACK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

#[inline]
fn state_for(hart: usize) -> &'static HartPreemptState {
    &PREEMPT_STATE[hart].0
}

/// RAII guard that disables preemption on the current hart while held.
/// !Send/!Sync: must stay on the same hart.
#[must_use = "if unused, preemption will be immediately re-enabled"]
pub struct PreemptGuard {
    hart: usize,
    _marker: PhantomData<*mut ()>,
}

impl PreemptGuard {
    #[inline]
    pub fn new() -> Self {
        let hart = get_current_hart();
        state_for(hart).count.fetch_add(1, Ordering::Relaxed);
        Self {
            hart,
            _marker: PhantomData,
        }
    }

    /// The hart this guard pinned. Stable for the guard's lifetime.
    #[inline]
    pub fn hart(&self) -> usize {
        self.hart
    }

    #[inline]
    pub fn is_active() -> bool {
        state_for(get_current_hart()).count.load(Ordering::Relaxed) > 0
    }

    #[inline]
    pub fn count() -> u32 {
        state_for(get_current_hart()).count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_reschedule_pending() {
        state_for(get_current_hart())
            .reschedule_pending
            .store(1, Ordering::Release);
    }

    #[inline]
    pub fn is_reschedule_pending() -> bool {
        state_for(get_current_hart())
            .reschedule_pending
            .load(Ordering::Acquire)
            != 0
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        let state = state_for(self.hart);
        let prev = state.count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "preempt count underflow");

        if prev == 1 && state.reschedule_pending.swap(0, Ordering::AcqRel) != 0 {
            let fn_ptr = RESCHEDULE_CALLBACK.load(Ordering::Acquire);
            if !fn_ptr.is_null() {
                // SAFETY: fn_ptr was set via register_reschedule_callback with a valid fn()
                let callback: fn() = unsafe { core::mem::transmute(fn_ptr) };
                callback();
            }
        }
    }
}

/// Register the scheduler's deferred-reschedule entry point. Invoked when the
/// last guard on a hart drops with a reschedule pending.
pub fn register_reschedule_callback(callback: fn()) {
    RESCHEDULE_CALLBACK.store(callback as *mut (), Ordering::Release);
}

#[inline]
pub fn is_preemption_disabled() -> bool {
    PreemptGuard::is_active()
}

#[inline]
pub fn preempt_count() -> u32 {
    PreemptGuard::count()
}
