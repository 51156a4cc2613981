//! # Kernel synchronization primitives
//!
//! Short, non-interruptible critical sections for kernel data structures.
//! The only primitive exported here is a [`SpinLock`]: acquisition is a
//! bounded busy-wait, never a scheduler-visible block, which makes it safe
//! to use from any execution context that must not suspend.
//!
//! Every lock carries a human-readable name so that diagnostics (deadlock
//! dumps, contention traces) can identify which lock a context is spinning
//! on without symbolication.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
