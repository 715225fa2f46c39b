//! # Kernel synchronization primitives
//!
//! The building blocks the memory subsystem is synchronized with:
//!
//! * [`RawSpin`] / [`SpinLock`]: short critical sections (cache shards,
//!   directory entries, the reclamation queue).
//! * [`SyncOnceCell`]: boot-time singletons.
//! * [`cpu`]: "which processor am I on", the index of every per-CPU array.
//! * [`quiesce`]: deferred reclamation; readers enter a [`QuiescentGuard`]
//!   section instead of disabling preemption.
//! * [`Sref`] / [`RefCount`] / [`Referenced`]: counted references with a
//!   last-reference hook.
//! * [`StripedRangeLock`]: range locking over a sparse index space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod cpu;
pub mod quiesce;
mod range_lock;
mod raw_spin;
mod spin_lock;
mod sref;
mod sync_once_cell;

pub use cpu::{CpuId, current_cpu};
pub use quiesce::{QuiescentGuard, Quiescence};
pub use range_lock::{RangeGuard, STRIPES, StripedRangeLock};
pub use raw_spin::RawSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sref::{RefCount, Referenced, Sref};
pub use sync_once_cell::SyncOnceCell;
