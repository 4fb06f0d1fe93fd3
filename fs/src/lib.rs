//! Storage-facing layers of the hartos core.
//!
//! The centrepiece is [`bcache`]: the block buffer cache that every consumer
//! of disk blocks — filesystem, journal, block-using drivers — goes through.
//! [`blockdev`] defines the device interface the cache drives on a miss.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod bcache;
pub mod blockdev;

pub use bcache::{
    BufCache, BufCacheStats, BufGuard, NBUCKETS, NBUF, PinnedBuf, buffer_cache, buffer_cache_init,
};
pub use blockdev::{BSIZE, BlockDevice, BlockDeviceError, MemoryBlockDevice};

#[cfg(test)]
mod tests;
