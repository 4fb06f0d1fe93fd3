//! Physical page frame allocator with per-hart shards.
//!
//! Every hart owns a shard: a lock-protected freelist it allocates from and
//! frees to. A frame freed on hart H lands in shard H, so uncontended
//! alloc/free traffic never crosses shard locks. When a shard runs dry the
//! hart **steals**: it sweeps the other shards in index order, lifting up to
//! [`STEAL_BATCH`] frames into its own scratch buffer, then splices them
//! onto its freelist.
//!
//! ```text
//!   alloc() ── pop own shard ──┐ hit ──► poison, return
//!                              │
//!                             miss
//!                              │
//!                     steal(other shards)      one victim lock at a time
//!                              │
//!                 0 frames ──► None   s > 0 ──► splice, pop, return
//! ```
//!
//! A free frame is self-describing: its first machine word links to the next
//! free frame, so the freelists cost no metadata memory. The unsafe
//! reinterpretation is confined to [`ShardList`].
//!
//! The whole of `alloc` and `free` runs with preemption disabled so that the
//! hart id picked at entry keeps naming the shard being mutated. No two
//! shard locks are ever held at once, which makes the locking trivially
//! deadlock-free.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use hartos_abi::addr::{PhysAddr, VirtAddr};
use hartos_lib::{
    CacheAligned, HartLocal, InitFlag, MAX_HARTS, PreemptGuard, SpinMutex, kfatal, klog_debug,
    klog_info,
};

use crate::direct_map::{self, PhysAddrDirectMap};
use crate::mm_constants::{ALLOC_POISON_BYTE, FREE_POISON_BYTE, PAGE_SIZE_4KB, STEAL_BATCH};

/// View of a free frame: the frame's own first word stores the link to the
/// next free frame.
#[repr(transparent)]
struct FreeFrame {
    next: *mut FreeFrame,
}

/// One shard's freelist. LIFO, intrusive.
struct ShardList {
    head: *mut FreeFrame,
    len: u64,
}

// SAFETY: the head pointer is only dereferenced under the owning shard's
// lock, and a frame is reachable from at most one list.
unsafe impl Send for ShardList {}

impl ShardList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    fn push(&mut self, frame: *mut FreeFrame) {
        // SAFETY: the caller hands over exclusive ownership of an unused,
        // in-range frame; writing its link word cannot alias live data.
        unsafe { (*frame).next = self.head };
        self.head = frame;
        self.len += 1;
    }

    fn pop(&mut self) -> *mut FreeFrame {
        let frame = self.head;
        if !frame.is_null() {
            // SAFETY: the frame came off this list, so its link word holds
            // the next element.
            self.head = unsafe { (*frame).next };
            self.len -= 1;
        }
        frame
    }
}

/// Landing pad for frames lifted out of other shards during a steal. Owned
/// by its hart; reachable only through the preemption-pinned accessor.
struct StealScratch {
    frames: [*mut FreeFrame; STEAL_BATCH],
}

impl StealScratch {
    const fn new() -> Self {
        Self {
            frames: [ptr::null_mut(); STEAL_BATCH],
        }
    }
}

// SAFETY: frames parked in the scratch belong exclusively to the stealing
// hart until they are spliced onto its freelist.
unsafe impl Send for StealScratch {}

pub struct PageAllocator {
    range_start: AtomicU64,
    range_end: AtomicU64,
    total: AtomicU64,
    init: InitFlag,
    shards: [CacheAligned<SpinMutex<ShardList>>; MAX_HARTS],
    scratch: HartLocal<StealScratch>,
}

impl PageAllocator {
    pub const fn new() -> Self {
        const SHARD: CacheAligned<SpinMutex<ShardList>> =
            CacheAligned(SpinMutex::new(ShardList::new()));
        const SCRATCH: CacheAligned<StealScratch> = CacheAligned(StealScratch::new());
        Self {
            range_start: AtomicU64::new(0),
            range_end: AtomicU64::new(0),
            total: AtomicU64::new(0),
            init: InitFlag::new(),
            shards: [SHARD; MAX_HARTS],
            scratch: HartLocal::new_with([SCRATCH; MAX_HARTS]),
        }
    }

    /// Hand `[start, end)` to the allocator and free every page-aligned
    /// frame in it. Must complete on the boot hart before any concurrent
    /// use; all frames initially land in the boot hart's shard and spread
    /// out through stealing.
    pub fn init(&self, start: PhysAddr, end: PhysAddr) {
        if !self.init.init_once() {
            kfatal!("page_alloc: init called twice");
        }
        let first = start.align_up(PAGE_SIZE_4KB).as_u64();
        let last = end.align_down(PAGE_SIZE_4KB).as_u64();
        if first >= last {
            kfatal!("page_alloc: empty managed range {}..{}", start, end);
        }
        self.range_start.store(first, Ordering::Release);
        self.range_end.store(last, Ordering::Release);

        let mut frames = 0u64;
        let mut page = first;
        while page + PAGE_SIZE_4KB <= last {
            self.free(PhysAddr::new(page));
            frames += 1;
            page += PAGE_SIZE_4KB;
        }
        self.total.store(frames, Ordering::Release);
        klog_info!(
            "page_alloc: {} frames ready ({}..{})",
            frames,
            PhysAddr::new(first),
            PhysAddr::new(last)
        );
    }

    /// Allocate one page frame. The returned frame is filled with
    /// [`ALLOC_POISON_BYTE`] to surface uninitialised reads. `None` when RAM
    /// is exhausted.
    pub fn alloc(&self) -> Option<PhysAddr> {
        // One preempt-off region spans the local pop, the steal, and the
        // splice, so `hart` keeps naming our shard throughout.
        let preempt = PreemptGuard::new();
        let hart = preempt.hart();

        let mut frame = self.shards[hart].0.lock().pop();

        if frame.is_null() {
            let mut scratch = self.scratch.get_mut();
            let stolen = self.steal(hart, &mut scratch);
            if stolen == 0 {
                klog_debug!("page_alloc: out of memory on hart {}", hart);
                return None;
            }
            let mut shard = self.shards[hart].0.lock();
            for &taken in &scratch.frames[..stolen] {
                shard.push(taken);
            }
            frame = shard.pop();
        }

        // SAFETY: the frame is exclusively ours now.
        unsafe { ptr::write_bytes(frame.cast::<u8>(), ALLOC_POISON_BYTE, PAGE_SIZE_4KB as usize) };
        Some(direct_map::virt_to_phys(VirtAddr::new(frame as u64)))
    }

    /// Return `frame` to the shard of the hart releasing it. The frame is
    /// filled with [`FREE_POISON_BYTE`] to surface dangling references.
    ///
    /// Fatal if the frame is misaligned or outside the managed range.
    /// Freeing a frame that is already free is a caller error the allocator
    /// cannot detect; the poison fill makes the corruption loud.
    pub fn free(&self, frame: PhysAddr) {
        if !frame.is_aligned(PAGE_SIZE_4KB)
            || frame.as_u64() < self.range_start.load(Ordering::Acquire)
            || frame.as_u64() >= self.range_end.load(Ordering::Acquire)
        {
            kfatal!("page_alloc: free of invalid frame {}", frame);
        }

        let preempt = PreemptGuard::new();
        let hart = preempt.hart();

        let page = frame.to_virt().as_mut_ptr::<u8>();
        // SAFETY: in-range, page-aligned, and ownership was just handed
        // back. Poison first; the list push then overwrites the link word.
        unsafe { ptr::write_bytes(page, FREE_POISON_BYTE, PAGE_SIZE_4KB as usize) };

        let mut shard = self.shards[hart].0.lock();
        shard.push(page.cast::<FreeFrame>());
    }

    /// Lift up to [`STEAL_BATCH`] frames from other shards into `scratch`.
    /// Victims are visited in index order, the thief is skipped, and exactly
    /// one shard lock is held at any moment.
    fn steal(&self, thief: usize, scratch: &mut StealScratch) -> usize {
        let mut count = 0;
        for victim in 0..MAX_HARTS {
            if victim == thief {
                continue;
            }
            let mut shard = self.shards[victim].0.lock();
            while count < STEAL_BATCH {
                let frame = shard.pop();
                if frame.is_null() {
                    break;
                }
                scratch.frames[count] = frame;
                count += 1;
            }
            drop(shard);
            if count == STEAL_BATCH {
                break;
            }
        }
        count
    }

    /// Frames handed to the allocator at init.
    pub fn total_frames(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Free frames summed across all shards. Exact only when quiescent.
    pub fn free_frames(&self) -> u64 {
        let mut sum = 0;
        for shard in &self.shards {
            sum += shard.0.lock().len;
        }
        sum
    }

    /// Free frames in one hart's shard.
    pub fn shard_free_frames(&self, hart: usize) -> u64 {
        self.shards[hart].0.lock().len
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Process-wide allocator
// ---------------------------------------------------------------------------

static PAGE_ALLOCATOR: PageAllocator = PageAllocator::new();

/// Initialise the process-wide allocator. Boot hart, once.
pub fn init_page_allocator(start: PhysAddr, end: PhysAddr) {
    PAGE_ALLOCATOR.init(start, end);
}

pub fn alloc_page_frame() -> Option<PhysAddr> {
    PAGE_ALLOCATOR.alloc()
}

pub fn free_page_frame(frame: PhysAddr) {
    PAGE_ALLOCATOR.free(frame);
}

pub fn page_allocator_total_frames() -> u64 {
    PAGE_ALLOCATOR.total_frames()
}

pub fn page_allocator_free_frames() -> u64 {
    PAGE_ALLOCATOR.free_frames()
}

pub fn page_allocator_shard_free_frames(hart: usize) -> u64 {
    PAGE_ALLOCATOR.shard_free_frames(hart)
}

// ---------------------------------------------------------------------------
// OwnedPageFrame — RAII wrapper for automatic page deallocation
// ---------------------------------------------------------------------------

/// An owned page frame that returns itself to the process-wide allocator
/// when dropped.
///
/// # Safety
///
/// Safe to use as long as the page is not accessed after the
/// `OwnedPageFrame` is dropped and the physical address is not leaked to
/// code that outlives it.
pub struct OwnedPageFrame {
    phys: PhysAddr,
}

impl OwnedPageFrame {
    /// Allocate a page frame. `None` when RAM is exhausted.
    #[inline]
    pub fn alloc() -> Option<Self> {
        alloc_page_frame().map(|phys| Self { phys })
    }

    /// The physical address of this frame, valid for the wrapper's lifetime.
    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    /// The frame's virtual address through the direct map.
    #[inline]
    pub fn virt_addr(&self) -> VirtAddr {
        self.phys.to_virt()
    }

    /// The frame as a typed mutable pointer.
    ///
    /// # Safety
    ///
    /// The pointer must not be used after this `OwnedPageFrame` is dropped,
    /// and concurrent access needs external synchronisation.
    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.virt_addr().as_mut_ptr()
    }

    /// Consume the wrapper and return the physical address without freeing.
    /// The caller becomes responsible for an eventual [`free_page_frame`].
    #[inline]
    pub fn into_phys(self) -> PhysAddr {
        let phys = self.phys;
        core::mem::forget(self);
        phys
    }

    /// Re-adopt a frame previously released with [`Self::into_phys`].
    ///
    /// # Safety
    ///
    /// The address must come from this allocator, must not have been freed,
    /// and no other owner may free it.
    #[inline]
    pub unsafe fn from_phys(phys: PhysAddr) -> Self {
        debug_assert!(!phys.is_null(), "OwnedPageFrame from null address");
        Self { phys }
    }
}

impl Drop for OwnedPageFrame {
    fn drop(&mut self) {
        if !self.phys.is_null() {
            free_page_frame(self.phys);
        }
    }
}

// SAFETY: a physical page can be handed between harts; the allocator
// synchronises internally.
unsafe impl Send for OwnedPageFrame {}

impl core::fmt::Debug for OwnedPageFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OwnedPageFrame")
            .field("phys", &format_args!("{:#x}", self.phys.as_u64()))
            .finish()
    }
}
