//! Block buffer cache.
//!
//! A fixed pool of block-sized buffers mediates all access to disk blocks:
//! it caches contents across uses and gives each block a single in-memory
//! home that callers serialise on. Consumers obtain a [`BufGuard`] via
//! [`BufCache::read`], mutate its data, optionally [`BufGuard::write`] it
//! back, and drop the guard when done.
//!
//! # Structure
//!
//! Buffers hang off [`NBUCKETS`] hash chains keyed by `(dev, blockno)`, each
//! chain under its own spin-lock, so hits on different buckets never
//! contend. Chains are indices into the fixed slot array; a buffer moves
//! between chains only when eviction re-homes it.
//!
//! A miss takes the single **eviction gate**, re-checks its bucket (a racer
//! may have installed the block first), then hunts the whole cache for the
//! least-recently-used free buffer. The scan holds at most one bucket lock
//! at a time, *retaining* the lock of whichever bucket currently holds the
//! best candidate so the candidate cannot move before it is claimed. The
//! gate makes concurrent hunts impossible, which is also what keeps a key
//! from ever being installed twice.
//!
//! # Lock ordering
//!
//! eviction gate → bucket locks. A buffer's sleep-lock is acquired only
//! after every spin-lock is released.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Once;

use hartos_lib::spinlock::SpinMutexGuard;
use hartos_lib::{InitFlag, SleepLock, SpinMutex, clock, kfatal, klog_info};

use crate::blockdev::{BSIZE, BlockDevice};

/// Buffers in the process-wide cache. Sized for the filesystem's worst-case
/// working set of concurrently dirty blocks.
pub const NBUF: usize = 30;

/// Hash chains. Prime, so block numbers with regular strides still spread.
pub const NBUCKETS: usize = 31;

/// Chain terminator / "no slot" marker.
const NIL: u32 = u32::MAX;

fn bucket_of(dev: u32, blockno: u32) -> usize {
    ((dev as u64 * 131 + blockno as u64 * 137) % NBUCKETS as u64) as usize
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct BufFlags: u8 {
        /// Data reflects the on-disk contents.
        const VALID = 1 << 0;
        /// The device owns the buffer: a transfer is in flight.
        const DISK_OWNED = 1 << 1;
    }
}

/// Metadata of one cache slot.
///
/// Field access rules (all access goes through raw pointers, field by
/// field):
///
/// - `dev`, `blockno`, `next`, `refcnt`, `last_used`: only while holding the
///   lock of the bucket the slot currently hangs off; a slot in transit
///   between buckets is covered by the eviction gate. Exception: a holder of
///   a reference (`refcnt > 0` on its behalf) may *read* `dev`/`blockno`
///   without the lock, since eviction never retargets a referenced slot.
/// - `flags`: owned by the holder of the slot's sleep-lock. The evictor may
///   reset it after observing `refcnt == 0` under the gate and bucket lock,
///   which excludes any sleep-lock holder.
struct BufMeta {
    dev: u32,
    blockno: u32,
    flags: BufFlags,
    refcnt: u32,
    last_used: u64,
    next: u32,
}

struct BufSlot {
    meta: UnsafeCell<BufMeta>,
    lock: SleepLock,
    data: UnsafeCell<[u8; BSIZE]>,
}

impl BufSlot {
    const fn new() -> Self {
        Self {
            meta: UnsafeCell::new(BufMeta {
                dev: 0,
                blockno: 0,
                flags: BufFlags::empty(),
                refcnt: 0,
                last_used: 0,
                next: NIL,
            }),
            lock: SleepLock::new(),
            data: UnsafeCell::new([0; BSIZE]),
        }
    }
}

// SAFETY: the UnsafeCells are governed by the locking discipline documented
// on BufMeta; data is only reached while the slot's sleep-lock is held.
unsafe impl Sync for BufSlot {}

/// A bucket's chain head: index of the first slot, or NIL.
struct Bucket {
    head: u32,
}

/// Snapshot of cache traffic counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub rehomes: u64,
}

pub struct BufCache<const N: usize> {
    buckets: [SpinMutex<Bucket>; NBUCKETS],
    eviction_gate: SpinMutex<()>,
    slots: [BufSlot; N],
    device: Once<&'static dyn BlockDevice>,
    init: InitFlag,
    hits: AtomicU64,
    misses: AtomicU64,
    rehomes: AtomicU64,
}

impl<const N: usize> BufCache<N> {
    pub const fn new() -> Self {
        const BUCKET: SpinMutex<Bucket> = SpinMutex::new(Bucket { head: NIL });
        const SLOT: BufSlot = BufSlot::new();
        Self {
            buckets: [BUCKET; NBUCKETS],
            eviction_gate: SpinMutex::new(()),
            slots: [SLOT; N],
            device: Once::new(),
            init: InitFlag::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rehomes: AtomicU64::new(0),
        }
    }

    /// Register the block device and chain every slot into bucket 0 (they
    /// spread across buckets as eviction re-homes them). Once, before use.
    pub fn init(&self, device: &'static dyn BlockDevice) {
        if !self.init.init_once() {
            kfatal!("bcache: init called twice");
        }
        self.device.call_once(|| device);

        let mut bucket0 = self.buckets[0].lock();
        for idx in (0..N as u32).rev() {
            let m = self.meta(idx);
            // SAFETY: bucket 0's lock is held; no slot is reachable yet.
            unsafe { (*m).next = bucket0.head };
            bucket0.head = idx;
        }
        klog_info!("bcache: {} buffers across {} buckets", N, NBUCKETS);
    }

    /// Return a guard on the buffer holding `(dev, blockno)`, its contents
    /// read in from the device if they were not already cached. Blocks while
    /// another caller holds the same buffer.
    pub fn read(&self, dev: u32, blockno: u32) -> BufGuard<'_, N> {
        let idx = self.acquire(dev, blockno);
        let m = self.meta(idx);
        // SAFETY: we hold the slot's sleep-lock, so flags are ours.
        if !unsafe { (*m).flags.contains(BufFlags::VALID) } {
            self.disk_rw(idx, false);
            unsafe { (*m).flags.insert(BufFlags::VALID) };
        }
        BufGuard {
            cache: self,
            idx,
            _not_send: PhantomData,
        }
    }

    /// Drop a pin taken with [`BufGuard::pin`]. The buffer becomes evictable
    /// again once its refcount reaches zero.
    pub fn unpin(&self, pin: PinnedBuf) {
        let m = self.meta(pin.idx);
        // SAFETY: the pin keeps refcnt > 0, so identity is stable.
        let (dev, blockno) = unsafe { ((*m).dev, (*m).blockno) };
        let _bucket = self.buckets[bucket_of(dev, blockno)].lock();
        // SAFETY: home bucket lock held.
        unsafe {
            if (*m).refcnt == 0 {
                kfatal!("bcache: unpin of unpinned buffer");
            }
            (*m).refcnt -= 1;
        }
    }

    pub fn stats(&self) -> BufCacheStats {
        BufCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rehomes: self.rehomes.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn meta(&self, idx: u32) -> *mut BufMeta {
        self.slots[idx as usize].meta.get()
    }

    /// Walk `bucket`'s chain for `(dev, blockno)`. Caller holds the lock of
    /// that bucket.
    fn scan(&self, bucket: &Bucket, dev: u32, blockno: u32) -> Option<u32> {
        let mut idx = bucket.head;
        while idx != NIL {
            let m = self.meta(idx);
            // SAFETY: bucket lock held (see BufMeta field rules).
            unsafe {
                if (*m).dev == dev && (*m).blockno == blockno {
                    return Some(idx);
                }
                idx = (*m).next;
            }
        }
        None
    }

    /// Find the buffer caching `(dev, blockno)` — installing one if needed —
    /// take a reference on it, and acquire its sleep-lock.
    fn acquire(&self, dev: u32, blockno: u32) -> u32 {
        let key = bucket_of(dev, blockno);
        loop {
            // Fast path: resident in its home bucket.
            {
                let bucket = self.buckets[key].lock();
                if let Some(idx) = self.scan(&bucket, dev, blockno) {
                    // SAFETY: bucket lock held.
                    unsafe { (*self.meta(idx)).refcnt += 1 };
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    drop(bucket);
                    self.slots[idx as usize].lock.acquire();
                    return idx;
                }
            }

            // Miss. The gate admits one victim hunt at a time; together with
            // the re-scan below it keeps a key from being installed twice.
            let gate = self.eviction_gate.lock();

            {
                let bucket = self.buckets[key].lock();
                if self.scan(&bucket, dev, blockno).is_some() {
                    // A racer installed it while we waited on the gate.
                    drop(bucket);
                    drop(gate);
                    continue;
                }
            }

            // The miss is now committed to us.
            self.misses.fetch_add(1, Ordering::Relaxed);
            let idx = self.evict_into(key, dev, blockno);
            drop(gate);
            self.slots[idx as usize].lock.acquire();
            return idx;
        }
    }

    /// Hunt the whole cache for the least-recently-used free buffer, re-home
    /// it to `key`'s chain, and give it its new identity with `refcnt = 1`
    /// and invalid contents. Called with the eviction gate held and no
    /// bucket lock held.
    fn evict_into(&self, key: usize, dev: u32, blockno: u32) -> u32 {
        let mut best = NIL;
        let mut best_prev = NIL; // NIL: best is its chain's head
        let mut best_bucket = 0usize;
        let mut retained: Option<SpinMutexGuard<'_, Bucket>> = None;

        for i in 0..NBUCKETS {
            let bucket = self.buckets[i].lock();
            let mut bingo = false;
            let mut prev = NIL;
            let mut idx = bucket.head;
            while idx != NIL {
                let m = self.meta(idx);
                // SAFETY: bucket i's lock is held; `best` (if any) lies in
                // the retained bucket, whose lock is also still held.
                unsafe {
                    if (*m).refcnt == 0
                        && (best == NIL || (*m).last_used < (*self.meta(best)).last_used)
                    {
                        best = idx;
                        best_prev = prev;
                        bingo = true;
                    }
                    prev = idx;
                    idx = (*m).next;
                }
            }
            if bingo {
                // This bucket now holds the candidate: keep it locked so the
                // candidate cannot move, and hand back the one retained so
                // far. At most two bucket locks are ever held here, in
                // ascending index order, and only under the gate.
                drop(retained.take());
                retained = Some(bucket);
                best_bucket = i;
            }
        }

        if best == NIL {
            // Every buffer is referenced. The pool is sized for the
            // filesystem's worst case, so this is a collaborator bug.
            kfatal!("bcache: out of buffers");
        }
        let m = self.meta(best);

        let target = if best_bucket != key {
            let mut old_bucket = retained.take().unwrap();
            // SAFETY: old bucket's lock is held; unlink `best` from it.
            unsafe {
                let next = (*m).next;
                if best_prev == NIL {
                    old_bucket.head = next;
                } else {
                    (*self.meta(best_prev)).next = next;
                }
            }
            drop(old_bucket);

            // `best` is in transit: reachable from no bucket, protected by
            // the gate. Push it onto its new home chain.
            self.rehomes.fetch_add(1, Ordering::Relaxed);
            let mut new_bucket = self.buckets[key].lock();
            // SAFETY: new bucket's lock is held.
            unsafe { (*m).next = new_bucket.head };
            new_bucket.head = best;
            new_bucket
        } else {
            retained.take().unwrap()
        };

        // SAFETY: `best` sits in `key`'s chain whose lock (`target`) is
        // held; refcnt == 0 was observed under lock, so no sleep-lock holder
        // exists and flags may be reset here.
        unsafe {
            (*m).dev = dev;
            (*m).blockno = blockno;
            (*m).flags = BufFlags::empty();
            (*m).refcnt = 1;
        }
        drop(target);
        best
    }

    /// One synchronous device transfer. Caller holds the slot's sleep-lock.
    fn disk_rw(&self, idx: u32, write: bool) {
        let Some(device) = self.device.get().copied() else {
            kfatal!("bcache: no block device registered");
        };
        let m = self.meta(idx);
        // SAFETY: sleep-lock held — identity stable (refcnt > 0), flags ours.
        let (dev, blockno) = unsafe { ((*m).dev, (*m).blockno) };
        unsafe { (*m).flags.insert(BufFlags::DISK_OWNED) };
        let data = self.slots[idx as usize].data.get();
        let result = if write {
            // SAFETY: sleep-lock held; the device only reads the buffer.
            device.write_block(dev, blockno, unsafe { &*data })
        } else {
            // SAFETY: sleep-lock held; no other reference to the data exists.
            device.read_block(dev, blockno, unsafe { &mut *data })
        };
        unsafe { (*m).flags.remove(BufFlags::DISK_OWNED) };
        if let Err(err) = result {
            kfatal!("bcache: dev {} block {} transfer failed: {:?}", dev, blockno, err);
        }
    }

    /// Release path shared by `BufGuard::release` and the guard's Drop.
    fn release_idx(&self, idx: u32) {
        let slot = &self.slots[idx as usize];
        if !slot.lock.holding() {
            kfatal!("bcache: release without buffer lock");
        }
        slot.lock.release();

        let m = self.meta(idx);
        // SAFETY: our reference keeps refcnt > 0, so identity is stable and
        // the home bucket can be computed before its lock is taken.
        let (dev, blockno) = unsafe { ((*m).dev, (*m).blockno) };
        let _bucket = self.buckets[bucket_of(dev, blockno)].lock();
        // SAFETY: home bucket lock held. The stamp happens exactly on the
        // transition to zero — that is what LRU ordering is built on.
        unsafe {
            (*m).refcnt -= 1;
            if (*m).refcnt == 0 {
                (*m).last_used = clock::ticks();
            }
        }
    }

    fn pin_idx(&self, idx: u32) {
        let m = self.meta(idx);
        // SAFETY: the caller's guard keeps refcnt > 0.
        let (dev, blockno) = unsafe { ((*m).dev, (*m).blockno) };
        let _bucket = self.buckets[bucket_of(dev, blockno)].lock();
        // SAFETY: home bucket lock held.
        unsafe { (*m).refcnt += 1 };
    }
}

impl<const N: usize> Default for BufCache<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle on one cached block.
///
/// Holds the buffer's sleep-lock and one reference for its lifetime; both
/// are returned when the guard drops. Not sendable — the sleep-lock owner is
/// the acquiring context.
pub struct BufGuard<'a, const N: usize> {
    cache: &'a BufCache<N>,
    idx: u32,
    _not_send: PhantomData<*mut ()>,
}

impl<const N: usize> BufGuard<'_, N> {
    pub fn dev(&self) -> u32 {
        // SAFETY: identity is stable while this guard holds a reference.
        unsafe { (*self.cache.meta(self.idx)).dev }
    }

    pub fn blockno(&self) -> u32 {
        // SAFETY: as in dev().
        unsafe { (*self.cache.meta(self.idx)).blockno }
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        // SAFETY: the guard holds the slot's sleep-lock; nothing else
        // touches the data array.
        unsafe { &*self.cache.slots[self.idx as usize].data.get() }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        // SAFETY: as in data(), and `&mut self` excludes other borrows
        // through this guard.
        unsafe { &mut *self.cache.slots[self.idx as usize].data.get() }
    }

    /// Write the buffer's contents to the device. Synchronous.
    pub fn write(&self) {
        if !self.cache.slots[self.idx as usize].lock.holding() {
            kfatal!("bcache: write without buffer lock");
        }
        self.cache.disk_rw(self.idx, true);
    }

    /// Take an extra reference that outlives this guard, keeping the buffer
    /// cached and unevictable until [`BufCache::unpin`]. Used by the journal
    /// to hold dirty blocks across transactions.
    pub fn pin(&self) -> PinnedBuf {
        self.cache.pin_idx(self.idx);
        PinnedBuf { idx: self.idx }
    }

    /// Explicitly release the buffer. Dropping the guard does the same.
    pub fn release(self) {}
}

impl<const N: usize> Drop for BufGuard<'_, N> {
    fn drop(&mut self) {
        self.cache.release_idx(self.idx);
    }
}

/// Token for a pinned buffer. Redeem with [`BufCache::unpin`] on the cache
/// that issued it.
#[must_use = "a pin keeps the buffer unevictable until unpinned"]
pub struct PinnedBuf {
    idx: u32,
}

// ---------------------------------------------------------------------------
// Process-wide cache
// ---------------------------------------------------------------------------

static BCACHE: BufCache<NBUF> = BufCache::new();

/// Initialise the process-wide cache. Once, before use.
pub fn buffer_cache_init(device: &'static dyn BlockDevice) {
    BCACHE.init(device);
}

pub fn buffer_cache() -> &'static BufCache<NBUF> {
    &BCACHE
}
