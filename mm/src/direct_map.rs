//! Linear physical↔virtual translation.
//!
//! This module is the single source of truth for the direct-map offset. The
//! platform maps all allocator-managed RAM at one linear offset in kernel
//! space; identity (offset 0) until the platform registers otherwise, which
//! is correct both for machines that run the kernel in physical addressing
//! and for the host-side test harness.

use core::sync::atomic::{AtomicU64, Ordering};

use hartos_abi::addr::{PhysAddr, VirtAddr};
use hartos_lib::InitFlag;
use hartos_lib::kfatal;

static DIRECT_MAP_OFFSET: AtomicU64 = AtomicU64::new(0);
static DIRECT_MAP_INIT: InitFlag = InitFlag::new();

/// Register the platform's direct-map offset. At most once, during boot.
pub fn init(offset: u64) {
    if !DIRECT_MAP_INIT.init_once() {
        kfatal!("direct_map: init called twice");
    }
    DIRECT_MAP_OFFSET.store(offset, Ordering::Release);
}

/// The active direct-map offset (0 = identity).
#[inline]
pub fn offset() -> u64 {
    DIRECT_MAP_OFFSET.load(Ordering::Acquire)
}

/// Extension trait adding direct-map translation to [`PhysAddr`].
pub trait PhysAddrDirectMap {
    /// The virtual address this physical address is mapped at.
    fn to_virt(self) -> VirtAddr;
}

impl PhysAddrDirectMap for PhysAddr {
    #[inline]
    fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.as_u64().wrapping_add(offset()))
    }
}

/// Invert the direct map for an address inside it.
#[inline]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new(virt.as_u64().wrapping_sub(offset()))
}
