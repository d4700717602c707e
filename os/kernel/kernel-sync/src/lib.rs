//! # Kernel synchronization primitives
//!
//! The memory core runs on a single core with interrupts disabled during
//! bring-up, but its singletons still live in `static`s and therefore need
//! `Sync` wrappers:
//!
//! * [`SpinLock`] guards the allocator state; the lock is the single global
//!   lock around bitmap and heap list mutation.
//! * [`SyncOnceCell`] holds the process-wide memory context, written exactly once.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
