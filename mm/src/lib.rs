//! Physical memory management for the hartos core.
//!
//! The interesting part is [`page_alloc`]: a per-hart sharded frame
//! allocator with work-stealing rebalancing. [`direct_map`] provides the
//! linear phys↔virt translation the allocator needs to touch frame contents.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod direct_map;
pub mod mm_constants;
pub mod page_alloc;

pub use page_alloc::{
    OwnedPageFrame, PageAllocator, alloc_page_frame, free_page_frame, init_page_allocator,
    page_allocator_free_frames, page_allocator_shard_free_frames, page_allocator_total_frames,
};
