//! Spin-locks for short, bounded critical sections.
//!
//! [`SpinMutex`] uses a **ticket lock** internally for FIFO fairness: each
//! acquirer takes a monotonically-increasing ticket and spins until
//! `now_serving` matches. This guarantees that harts acquire the lock in the
//! order they requested it, eliminating starvation under SMP contention.
//!
//! Acquisition disables preemption for the duration of the critical section
//! (the guard nests a [`PreemptGuard`]), so the holder cannot be migrated or
//! descheduled while the lock is held. Critical sections must not sleep.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, Ordering};

use crate::preempt::PreemptGuard;

pub struct SpinMutex<T> {
    /// Monotonically-increasing ticket counter. Each `lock()` call takes the
    /// next ticket via `fetch_add(1)`. Wraps at `u16::MAX` — equality checks
    /// handle wrap-around correctly.
    next_ticket: AtomicU16,
    /// The ticket currently being served. Incremented by `fetch_add(1)` on
    /// unlock. A waiter spins until `now_serving == my_ticket`.
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

// SAFETY: SpinMutex provides exclusive access through ticket-lock acquisition
// with preemption disabled, making it safe to share across harts.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
    _preempt: PreemptGuard,
}

impl<T> SpinMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Check if the lock is currently held (or has waiters).
    #[inline]
    pub fn is_locked(&self) -> bool {
        let next = self.next_ticket.load(Ordering::Relaxed);
        let serving = self.now_serving.load(Ordering::Relaxed);
        next != serving
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let preempt = PreemptGuard::new();

        // Take a ticket. fetch_add wraps at u16::MAX → 0; equality checks are
        // wrap-safe so this is correct for any number of acquisitions.
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Spin until our ticket is being served. The read of `now_serving` is
        // Acquire so that all writes made by the previous holder are visible
        // once we observe our ticket being served.
        //
        // Proportional backoff: the further away our ticket is from
        // now_serving, the more PAUSE iterations we issue per check. This
        // reduces cache-line traffic when multiple harts are queued.
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            let distance = my_ticket.wrapping_sub(serving) as u32;
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }

        SpinMutexGuard {
            mutex: self,
            _preempt: preempt,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        let preempt = PreemptGuard::new();

        // Succeed only if the lock is currently free (next_ticket ==
        // now_serving). CAS next_ticket forward by 1; if someone else grabbed
        // a ticket in the meantime the CAS fails and we bail out without
        // waiting.
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(SpinMutexGuard {
                mutex: self,
                _preempt: preempt,
            })
        } else {
            drop(preempt);
            None
        }
    }
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // Advance now_serving to hand the lock to the next waiter in FIFO
        // order. Release ordering ensures our writes are visible to the next
        // acquirer.
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        // _preempt drops after this, potentially triggering deferred reschedule
    }
}
