use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use std::boxed::Box;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;
use std::vec::Vec;

use hartos_lib::clock;
use hartos_lib::hart::register_hart_id_fn;

use crate::bcache::{BufCache, buffer_cache, buffer_cache_init};
use crate::blockdev::{BSIZE, BlockDevice, BlockDeviceError, MemoryBlockDevice};

// ---------------------------------------------------------------------------
// Test support: thread-pinned harts and a device that counts its transfers.
// ---------------------------------------------------------------------------

std::thread_local! {
    static TEST_HART: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

fn test_hart_id() -> usize {
    TEST_HART.with(|h| h.get())
}

fn pin_test_hart(id: usize) {
    TEST_HART.with(|h| h.set(id));
    register_hart_id_fn(test_hart_id);
}

struct CountingDisk {
    inner: MemoryBlockDevice<64>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl CountingDisk {
    fn new() -> Self {
        Self {
            inner: MemoryBlockDevice::new(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn peek(&self, blockno: u32) -> [u8; BSIZE] {
        let mut buf = [0u8; BSIZE];
        self.inner.read_block(0, blockno, &mut buf).unwrap();
        buf
    }
}

impl BlockDevice for CountingDisk {
    fn read_block(
        &self,
        dev: u32,
        blockno: u32,
        buf: &mut [u8; BSIZE],
    ) -> Result<(), BlockDeviceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_block(dev, blockno, buf)
    }

    fn write_block(
        &self,
        dev: u32,
        blockno: u32,
        buf: &[u8; BSIZE],
    ) -> Result<(), BlockDeviceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_block(dev, blockno, buf)
    }
}

fn new_cache<const N: usize>() -> (&'static BufCache<N>, &'static CountingDisk) {
    let disk = Box::leak(Box::new(CountingDisk::new()));
    let cache = Box::leak(Box::new(BufCache::<N>::new()));
    cache.init(disk);
    (cache, disk)
}

// ---------------------------------------------------------------------------
// Hit/miss behaviour
// ---------------------------------------------------------------------------

#[test]
fn test_read_hit_skips_device() {
    let (cache, disk) = new_cache::<30>();
    disk.inner.load_block(42, &[0xAB; BSIZE]).unwrap();

    let guard = cache.read(1, 42);
    assert_eq!(disk.reads(), 1);
    assert_eq!(guard.dev(), 1);
    assert_eq!(guard.blockno(), 42);
    assert_eq!(guard.data()[0], 0xAB);
    guard.release();

    // Same key again: same buffer, no device traffic.
    let guard = cache.read(1, 42);
    assert_eq!(disk.reads(), 1);
    guard.release();

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_cache_retains_caller_writes() {
    let (cache, disk) = new_cache::<30>();

    let mut guard = cache.read(1, 43);
    guard.data_mut()[0] = 0x5A;
    guard.data_mut()[BSIZE - 1] = 0xA5;
    guard.release();

    let guard = cache.read(1, 43);
    assert_eq!(disk.reads(), 1, "hit must not re-read the device");
    assert_eq!(guard.data()[0], 0x5A);
    assert_eq!(guard.data()[BSIZE - 1], 0xA5);
    guard.release();
}

#[test]
fn test_write_reaches_device() {
    let (cache, disk) = new_cache::<30>();

    let mut guard = cache.read(1, 7);
    guard.data_mut().fill(0x77);
    guard.write();
    assert_eq!(disk.writes(), 1);
    assert_eq!(disk.peek(7), [0x77; BSIZE]);
    guard.release();
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[test]
fn test_eviction_picks_lru() {
    let (cache, disk) = new_cache::<4>();

    // Touch four distinct keys in order, stamping strictly increasing
    // release times.
    let mut slot_ptrs = Vec::new();
    for blockno in 1..=4u32 {
        let guard = cache.read(1, blockno);
        slot_ptrs.push(guard.data().as_ptr() as usize);
        guard.release();
        clock::clock_tick();
    }

    // A fifth key must recycle the slot of (1,1), the oldest release.
    let guard = cache.read(1, 5);
    assert_eq!(guard.data().as_ptr() as usize, slot_ptrs[0]);
    guard.release();

    // (1,2)..(1,4) are still resident.
    let reads_before = disk.reads();
    for blockno in 2..=4u32 {
        cache.read(1, blockno).release();
    }
    assert_eq!(disk.reads(), reads_before);

    // (1,1) is gone: reading it again hits the device.
    cache.read(1, 1).release();
    assert_eq!(disk.reads(), reads_before + 1);
}

#[test]
fn test_eviction_rehomes_across_buckets() {
    // One buffer, so every new key evicts it. bucket(1,3) = 15,
    // bucket(1,2) = 2, bucket(1,33) = 2.
    let (cache, disk) = new_cache::<1>();

    cache.read(1, 3).release();
    let stats = cache.stats();
    assert_eq!(stats.rehomes, 1, "boot home is bucket 0, (1,3) lives in 15");

    cache.read(1, 2).release();
    assert_eq!(cache.stats().rehomes, 2, "moved from bucket 15 to bucket 2");

    // A hit proves the buffer is findable in its home bucket after the move.
    let reads = disk.reads();
    cache.read(1, 2).release();
    assert_eq!(disk.reads(), reads);

    // Same-bucket eviction: (1,33) also hashes to bucket 2 — identity
    // changes, home does not.
    cache.read(1, 33).release();
    let stats = cache.stats();
    assert_eq!(stats.rehomes, 2);
    assert_eq!(stats.misses, 3);
}

#[test]
#[should_panic(expected = "bcache: out of buffers")]
fn test_fully_pinned_pool_is_fatal() {
    let (cache, _disk) = new_cache::<1>();
    let _held = cache.read(1, 1);
    // The only buffer is referenced; a second key has no victim.
    let _ = cache.read(1, 2);
}

// ---------------------------------------------------------------------------
// Pinning
// ---------------------------------------------------------------------------

#[test]
fn test_pin_blocks_eviction() {
    let (cache, disk) = new_cache::<2>();

    let guard = cache.read(1, 10);
    let pin = guard.pin();
    guard.release();

    // Pressure from fresh keys may only recycle the unpinned slot.
    cache.read(1, 11).release();
    clock::clock_tick();
    cache.read(1, 12).release();
    clock::clock_tick();

    let reads = disk.reads();
    cache.read(1, 10).release();
    assert_eq!(disk.reads(), reads, "pinned buffer must stay cached");

    cache.unpin(pin);

    // Unpinned and oldest: the next miss takes it.
    cache.read(1, 13).release();
    let reads = disk.reads();
    cache.read(1, 10).release();
    assert_eq!(disk.reads(), reads + 1, "unpinned buffer became evictable");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_racing_misses_install_one_buffer() {
    let (cache, disk) = new_cache::<8>();
    let barrier = Barrier::new(2);

    let (first_ptr, second_ptr, seen_byte) = thread::scope(|s| {
        let barrier = &barrier;
        let first = s.spawn(move || {
            pin_test_hart(1);
            barrier.wait();
            let mut guard = cache.read(1, 7);
            let ptr = guard.data().as_ptr() as usize;
            guard.data_mut()[0] = 9;
            // Hold the buffer long enough for the racer to block on it.
            thread::sleep(Duration::from_millis(50));
            guard.release();
            ptr
        });
        let second = s.spawn(move || {
            pin_test_hart(2);
            barrier.wait();
            thread::sleep(Duration::from_millis(10));
            let guard = cache.read(1, 7);
            (guard.data().as_ptr() as usize, guard.data()[0])
        });
        let first_ptr = first.join().unwrap();
        let (second_ptr, seen_byte) = second.join().unwrap();
        (first_ptr, second_ptr, seen_byte)
    });

    assert_eq!(first_ptr, second_ptr, "both callers must share one buffer");
    assert_eq!(seen_byte, 9, "second caller observes the first one's write");
    assert_eq!(disk.reads(), 1, "the block was read exactly once");
}

#[test]
fn test_buffer_exclusion_across_threads() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 25;

    let (cache, _disk) = new_cache::<8>();
    let in_critical = AtomicU32::new(0);

    thread::scope(|s| {
        for hart in 1..=THREADS {
            let in_critical = &in_critical;
            s.spawn(move || {
                pin_test_hart(hart);
                for _ in 0..ROUNDS {
                    let guard = cache.read(2, 5);
                    let nested = in_critical.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(nested, 0, "two holders of one buffer");
                    thread::yield_now();
                    in_critical.fetch_sub(1, Ordering::SeqCst);
                    guard.release();
                }
            });
        }
    });
}

#[test]
fn test_churn_across_threads() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 100;
    const KEYS: u32 = 20;

    // Pool much smaller than the key set, so the workload is eviction-heavy.
    let (cache, disk) = new_cache::<8>();
    for blockno in 0..KEYS {
        disk.inner
            .load_block(blockno, &[blockno as u8; BSIZE])
            .unwrap();
    }

    thread::scope(|s| {
        for t in 0..THREADS {
            s.spawn(move || {
                pin_test_hart(t + 1);
                for i in 0..ROUNDS {
                    let blockno = ((i * 7 + t * 13) as u32) % KEYS;
                    let guard = cache.read(1, blockno);
                    assert_eq!(guard.blockno(), blockno);
                    assert_eq!(guard.data()[0], blockno as u8);
                    guard.release();
                }
            });
        }
    });

    let stats = cache.stats();
    assert_eq!(
        stats.hits + stats.misses,
        (THREADS * ROUNDS) as u64,
        "every read resolved to exactly one hit or miss"
    );
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

#[test]
#[should_panic(expected = "bcache: init called twice")]
fn test_double_init_is_fatal() {
    let disk = Box::leak(Box::new(CountingDisk::new()));
    let cache = Box::leak(Box::new(BufCache::<4>::new()));
    cache.init(disk);
    cache.init(disk);
}

#[test]
fn test_process_wide_cache() {
    // Sole test touching the process-wide singleton.
    let disk = Box::leak(Box::new(CountingDisk::new()));
    disk.inner.load_block(9, &[0xEE; BSIZE]).unwrap();
    buffer_cache_init(disk);

    let cache = buffer_cache();
    let guard = cache.read(1, 9);
    assert_eq!(guard.data()[0], 0xEE);
    guard.release();
}
