//! Hart identity.
//!
//! The core never discovers hart ids itself — the platform registers a
//! resolver during boot (reading `mhartid`, a per-CPU control block, or
//! whatever the machine provides). Until one is registered every caller is
//! treated as hart 0, which is correct for single-threaded early boot.
//!
//! A hart id is only meaningful while preemption is disabled; see
//! [`crate::preempt::PreemptGuard`].

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Maximum number of harts supported. Per-hart structures (allocator shards,
/// preemption counters) are sized by this.
pub const MAX_HARTS: usize = 8;

/// Signature of a platform hart-id resolver. Must return a value below
/// [`MAX_HARTS`] that is stable while preemption is disabled.
pub type HartIdFn = fn() -> usize;

static HART_ID_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Register the platform's hart-id resolver. Typically called once while the
/// machine is still single-threaded; re-registration replaces the resolver.
pub fn register_hart_id_fn(resolver: HartIdFn) {
    HART_ID_FN.store(resolver as *mut (), Ordering::Release);
}

/// The id of the hart we are executing on, 0 before a resolver is registered.
#[inline]
pub fn get_current_hart() -> usize {
    let ptr = HART_ID_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only `HartIdFn` values are stored, by `register_hart_id_fn`.
    let resolver: HartIdFn = unsafe { core::mem::transmute(ptr) };
    resolver()
}
