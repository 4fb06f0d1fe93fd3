//! Shared kernel primitives for the hartos core.
//!
//! Everything in here is hart-portable: locking, preemption control, per-hart
//! storage, blocking, time, logging, and the registration points through
//! which the platform wires in its scheduler and hart identity.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod clock;
pub mod hart;
pub mod hart_local;
pub mod init_flag;
pub mod kernel_services;
pub mod kfatal;
pub mod klog;
pub mod preempt;
pub mod sleeplock;
pub mod spinlock;
pub mod waitqueue;

pub use hart::{MAX_HARTS, get_current_hart, register_hart_id_fn};
pub use hart_local::{CacheAligned, HartLocal, HartPinned, HartPinnedMut};
pub use init_flag::InitFlag;
pub use klog::{KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level};
pub use preempt::{PreemptGuard, is_preemption_disabled, preempt_count};
pub use sleeplock::SleepLock;
pub use spinlock::{SpinMutex, SpinMutexGuard};
pub use waitqueue::WaitQueue;
