//! Wait queue primitive for blocking and waking tasks.
//!
//! Provides a fixed-capacity queue of blocked tasks that can be woken
//! individually (`wake_one`) or all at once (`wake_all`). Integrates with the
//! scheduler through the registered [runtime services]; before a scheduler is
//! registered, waiting degrades to polling the condition, so the primitive is
//! usable from the first instruction of boot.
//!
//! [runtime services]: crate::kernel_services::runtime
//!
//! # Usage
//!
//! ```rust,ignore
//! static MY_WQ: WaitQueue = WaitQueue::new();
//!
//! // Waiting side (consumer):
//! MY_WQ.wait_event(|| has_data());
//!
//! // Waking side (producer):
//! MY_WQ.wake_one();
//! ```

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel_services::runtime::{TaskHandle, runtime_services};
use crate::spinlock::SpinMutex;

/// Maximum number of tasks that can wait on a single `WaitQueue`.
const WAITQUEUE_CAPACITY: usize = 32;

const NULL_HANDLE: TaskHandle = core::ptr::null_mut();

/// Inner state of a wait queue, protected by the spin-lock.
struct WaitQueueInner {
    /// Waiting task handles. Null entries are empty slots.
    waiters: [TaskHandle; WAITQUEUE_CAPACITY],
    /// Number of active waiters.
    count: usize,
}

impl WaitQueueInner {
    const fn new() -> Self {
        Self {
            waiters: [NULL_HANDLE; WAITQUEUE_CAPACITY],
            count: 0,
        }
    }

    /// Add `task` to the queue. Returns `true` on success, `false` if full.
    fn enqueue(&mut self, task: TaskHandle) -> bool {
        if task.is_null() {
            return false;
        }
        for slot in self.waiters.iter_mut() {
            if slot.is_null() {
                *slot = task;
                self.count += 1;
                return true;
            }
        }
        false
    }

    /// Remove and return the first waiting task, or `None`.
    fn dequeue_one(&mut self) -> Option<TaskHandle> {
        for slot in self.waiters.iter_mut() {
            if !slot.is_null() {
                let task = *slot;
                *slot = NULL_HANDLE;
                self.count = self.count.saturating_sub(1);
                return Some(task);
            }
        }
        None
    }

    /// Remove all waiting tasks, calling `f` for each. Returns the count.
    fn dequeue_all(&mut self, mut f: impl FnMut(TaskHandle)) -> usize {
        let mut woken = 0;
        for slot in self.waiters.iter_mut() {
            if !slot.is_null() {
                let task = *slot;
                *slot = NULL_HANDLE;
                f(task);
                woken += 1;
            }
        }
        self.count = 0;
        woken
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// SAFETY: `TaskHandle` (`*mut c_void`) is managed by the scheduler. Access is
// synchronized through the spin-lock.
unsafe impl Send for WaitQueueInner {}

/// A wait queue for blocking and waking tasks.
///
/// Tasks call [`wait_event`] to sleep until a condition is met. Producers
/// call [`wake_one`] or [`wake_all`] when the condition changes.
///
/// [`wait_event`]: WaitQueue::wait_event
/// [`wake_one`]: WaitQueue::wake_one
/// [`wake_all`]: WaitQueue::wake_all
pub struct WaitQueue {
    inner: SpinMutex<WaitQueueInner>,
    /// Monotonic counter incremented on each wake, used for debugging.
    generation: AtomicU32,
}

impl WaitQueue {
    /// Create a new empty wait queue.
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(WaitQueueInner::new()),
            generation: AtomicU32::new(0),
        }
    }

    /// Block the current task until `condition()` returns `true`.
    ///
    /// The condition is re-checked under the wait queue lock before sleeping.
    /// If the condition is already true, returns immediately without
    /// blocking. Without a registered scheduler runtime the wait is a
    /// condition poll.
    ///
    /// Returns `true` if the condition was met, `false` if the wait queue was
    /// full (could not enqueue — caller should retry).
    ///
    /// # Lost-wakeup safety
    ///
    /// The scheduler's pending-wakeup handling covers the window between
    /// enqueueing and `block_current_task()`: if `unblock_task()` fires in
    /// between, the block is skipped.
    pub fn wait_event<F: Fn() -> bool>(&self, condition: F) -> bool {
        loop {
            // Check condition first — fast path.
            if condition() {
                return true;
            }

            let Some(rt) = runtime_services() else {
                // No scheduler yet: poll.
                spin_loop();
                continue;
            };

            let task = (rt.current_task)();
            if task.is_null() {
                spin_loop();
                continue;
            }

            {
                let mut inner = self.inner.lock();
                // Re-check condition under lock to close the race window.
                if condition() {
                    return true;
                }
                if !inner.enqueue(task) {
                    // Queue full — cannot wait.
                    return false;
                }
            }
            // Lock dropped here — window where wake_one could fire. The
            // scheduler's pending-wakeup flag covers this window.

            (rt.block_current_task)();

            // Woken up (or spurious wakeup). Re-check at the top of the loop.
        }
    }

    /// Wake one waiting task.
    ///
    /// Returns `true` if a task was woken, `false` if the queue was empty.
    pub fn wake_one(&self) -> bool {
        let task = {
            let mut inner = self.inner.lock();
            inner.dequeue_one()
        };

        match (task, runtime_services()) {
            (Some(task), Some(rt)) => {
                self.generation.fetch_add(1, Ordering::Relaxed);
                let _ = (rt.unblock_task)(task);
                true
            }
            _ => false,
        }
    }

    /// Wake all waiting tasks. Returns the number of tasks woken.
    pub fn wake_all(&self) -> usize {
        // Collect under the lock, then unblock outside it so the scheduler
        // does its work without the wait queue lock held.
        let mut tasks = [NULL_HANDLE; WAITQUEUE_CAPACITY];
        let count = {
            let mut inner = self.inner.lock();
            let mut i = 0;
            inner.dequeue_all(|t| {
                if i < tasks.len() {
                    tasks[i] = t;
                    i += 1;
                }
            })
        };

        let Some(rt) = runtime_services() else {
            return 0;
        };

        if count > 0 {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }

        for task in &tasks[..count] {
            let _ = (rt.unblock_task)(*task);
        }
        count
    }

    /// Check if there are any waiters.
    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().is_empty()
    }

    /// Number of waiting tasks.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().count
    }

    /// Wake generation counter (for debugging and tests).
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
