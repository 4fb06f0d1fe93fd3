//! Registration points for services the platform provides to the core.
//!
//! The core crates are leaves: they cannot link against the scheduler or the
//! drivers that sit above them. Instead the platform registers small tables
//! of function pointers here during bring-up, and the core calls through
//! them.

pub mod runtime;
