//! Scheduler runtime services consumed by blocking primitives.
//!
//! The wait queue (and through it the sleep-lock) needs to park and wake
//! tasks, but the scheduler lives above this crate. The scheduler registers
//! its entry points once during bring-up; until then, blocking primitives
//! fall back to polling, which is correct (if wasteful) for single-threaded
//! early boot.

use core::ffi::c_void;

use spin::Once;

/// Opaque handle to a schedulable task.
pub type TaskHandle = *mut c_void;

pub struct RuntimeServices {
    /// Handle of the task running on the current hart, null if none.
    pub current_task: fn() -> TaskHandle,
    /// Stable id of the current task, 0 if none.
    pub current_task_id: fn() -> u32,
    /// Deschedule the current task until somebody unblocks it.
    pub block_current_task: fn(),
    /// Make a previously blocked task runnable again.
    pub unblock_task: fn(TaskHandle) -> i32,
}

static RUNTIME: Once<&'static RuntimeServices> = Once::new();

/// Register the scheduler's service table. First registration wins.
pub fn register_runtime_services(services: &'static RuntimeServices) {
    RUNTIME.call_once(|| services);
}

#[inline]
pub fn runtime_services() -> Option<&'static RuntimeServices> {
    RUNTIME.get().copied()
}

#[inline]
pub fn is_runtime_initialized() -> bool {
    RUNTIME.get().is_some()
}
