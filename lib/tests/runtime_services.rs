//! Scheduler-backed blocking: the wait queue and sleep-lock driven through a
//! registered runtime table instead of the boot polling fallback.
//!
//! Runs as its own test binary because the service registration is one-shot
//! per process; the unit tests in `src/tests.rs` deliberately exercise the
//! no-runtime fallback and must not see this table.

use core::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{LazyLock, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use hartos_lib::kernel_services::runtime::{
    RuntimeServices, TaskHandle, is_runtime_initialized, register_runtime_services,
    runtime_services,
};
use hartos_lib::{SleepLock, WaitQueue};

// ---------------------------------------------------------------------------
// Minimal scheduler stand-in: tasks are threads, blocking parks the thread,
// unblocking unparks it. Park's wakeup token supplies the pending-wakeup
// behaviour the wait queue's enqueue-then-block window relies on.
// ---------------------------------------------------------------------------

std::thread_local! {
    static TASK_SLOT: Cell<u8> = const { Cell::new(0) };
}

static THREADS: LazyLock<Mutex<HashMap<usize, Thread>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn task_key() -> usize {
    TASK_SLOT.with(|slot| slot as *const Cell<u8> as usize)
}

fn fake_current_task() -> TaskHandle {
    let key = task_key();
    THREADS
        .lock()
        .unwrap()
        .entry(key)
        .or_insert_with(thread::current);
    key as TaskHandle
}

fn fake_current_task_id() -> u32 {
    (task_key() >> 4) as u32
}

fn fake_block_current_task() {
    thread::park();
}

fn fake_unblock_task(task: TaskHandle) -> i32 {
    match THREADS.lock().unwrap().get(&(task as usize)) {
        Some(thread) => {
            thread.unpark();
            0
        }
        None => -1,
    }
}

static SERVICES: RuntimeServices = RuntimeServices {
    current_task: fake_current_task,
    current_task_id: fake_current_task_id,
    block_current_task: fake_block_current_task,
    unblock_task: fake_unblock_task,
};

fn install_runtime() {
    register_runtime_services(&SERVICES);
    assert!(is_runtime_initialized());
    assert!(runtime_services().is_some());
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_waitqueue_blocks_and_wakes_through_runtime() {
    install_runtime();

    let wq = WaitQueue::new();
    let ready = AtomicBool::new(false);

    thread::scope(|s| {
        let waiter = s.spawn(|| wq.wait_event(|| ready.load(Ordering::Acquire)));

        // The waiter must actually enqueue and park, not poll.
        assert!(wait_until(Duration::from_secs(5), || wq.has_waiters()));
        let generation = wq.generation();

        ready.store(true, Ordering::Release);
        assert!(wq.wake_one());
        assert!(waiter.join().unwrap());
        assert!(wq.generation() > generation);
    });
    assert_eq!(wq.waiter_count(), 0);
}

#[test]
fn test_waitqueue_wake_all_through_runtime() {
    install_runtime();

    const WAITERS: usize = 3;
    let wq = WaitQueue::new();
    let ready = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..WAITERS {
            s.spawn(|| assert!(wq.wait_event(|| ready.load(Ordering::Acquire))));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            wq.waiter_count() >= WAITERS
        }));
        ready.store(true, Ordering::Release);
        assert!(wq.wake_all() >= WAITERS);
    });
    assert!(!wq.has_waiters());
}

#[test]
fn test_sleeplock_owner_is_task_through_runtime() {
    install_runtime();

    // With a runtime registered, owner tokens are task handles — distinct per
    // thread without any hart pinning.
    assert_ne!((runtime_services().unwrap().current_task_id)(), 0);

    let lock = SleepLock::new();
    let in_critical = AtomicU32::new(0);

    thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                for _ in 0..50 {
                    lock.acquire();
                    assert!(lock.holding());
                    let nested = in_critical.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(nested, 0, "two holders inside the sleeplock");
                    thread::yield_now();
                    in_critical.fetch_sub(1, Ordering::SeqCst);
                    lock.release();
                }
            });
        }
    });
    assert!(!lock.holding());
}
