//! Sleeping locks for long-held resources.
//!
//! A [`SleepLock`] yields the hart while waiting instead of spinning, so it
//! is the right exclusion primitive for resources held across I/O — most
//! prominently the per-buffer locks in the buffer cache. The lock state
//! itself lives under a spin-lock; only the *waiting* sleeps.
//!
//! Ownership is tracked so that releasing a lock you do not hold is a fatal
//! error, matching the contract the filesystem layers rely on. The owner is
//! identified by task when a scheduler runtime is registered, by hart before
//! that.

use crate::hart::get_current_hart;
use crate::kernel_services::runtime::runtime_services;
use crate::spinlock::SpinMutex;
use crate::waitqueue::WaitQueue;

const NO_OWNER: u64 = 0;

/// Owner tokens for contexts with no scheduler: the hart id, tagged so it
/// can never collide with a task handle.
const HART_TOKEN_BASE: u64 = 1 << 63;

fn current_owner_token() -> u64 {
    if let Some(rt) = runtime_services() {
        let task = (rt.current_task)();
        if !task.is_null() {
            return task as u64;
        }
    }
    HART_TOKEN_BASE | get_current_hart() as u64
}

struct SleepLockState {
    locked: bool,
    owner: u64,
}

pub struct SleepLock {
    state: SpinMutex<SleepLockState>,
    wq: WaitQueue,
}

impl SleepLock {
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(SleepLockState {
                locked: false,
                owner: NO_OWNER,
            }),
            wq: WaitQueue::new(),
        }
    }

    /// Acquire the lock, yielding the hart while it is contended.
    pub fn acquire(&self) {
        // `false` means the wait queue was momentarily full; retry.
        while !self.wq.wait_event(|| self.try_acquire_once()) {}
    }

    fn try_acquire_once(&self) -> bool {
        let mut st = self.state.lock();
        if st.locked {
            return false;
        }
        st.locked = true;
        st.owner = current_owner_token();
        true
    }

    /// Release the lock and wake one waiter.
    ///
    /// Fatal if the caller does not hold the lock.
    pub fn release(&self) {
        {
            let mut st = self.state.lock();
            if !st.locked || st.owner != current_owner_token() {
                crate::kfatal!("sleeplock: release without holding");
            }
            st.locked = false;
            st.owner = NO_OWNER;
        }
        self.wq.wake_one();
    }

    /// Does the calling context hold this lock?
    pub fn holding(&self) -> bool {
        let st = self.state.lock();
        st.locked && st.owner == current_owner_token()
    }
}

impl Default for SleepLock {
    fn default() -> Self {
        Self::new()
    }
}
