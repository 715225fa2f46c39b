//! # Kernel Physical Memory Allocation
//!
//! This crate turns the loader's memory map into the kernel's supply of
//! physical pages and fixed-size objects.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Kalloc                            │
//! │    • per-processor page pools, round-robin steal    │
//! │    • per-processor slab pools (stacks, perf, …)     │
//! │    • PageInfo: refcounted per-page metadata         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                   Kmem                              │
//! │    • lock-free Treiber stack, tagged head (ABA)     │
//! │    • links stored inside the free blocks            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │         BootMemoryMap + DirectMap                   │
//! │    • sorted usable ranges, range walking            │
//! │    • physical ↔ direct-map translation              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Boot
//!
//! The kernel builds a [`BootMemoryMap`] from the loader's regions and calls
//! [`Kalloc::init`] once, with the first address past its image and boot
//! allocations. From then on every processor allocates and frees without
//! locks:
//!
//! ```rust,ignore
//! let map = BootMemoryMap::from_regions(regions)?;
//! let config = KallocConfig::kernel_default(ncpu, kernel_end);
//! let kalloc = unsafe { Kalloc::init(map, DirectMap::hhdm(), &config)? };
//!
//! let page = kalloc.alloc(Some("pipe")).expect("out of memory");
//! unsafe { kalloc.free(page) };
//! ```
//!
//! ## Debug fill
//!
//! With junk filling enabled, blocks of up to 16 KiB are overwritten with
//! `0x02` when handed out and with `0x01` when freed after boot, so reads of
//! uninitialized or freed memory stand out.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addr;
pub mod boot_mem;
mod config;
mod error;
pub mod free_list;
mod kalloc;
mod page_info;
pub mod phys_mapper;
mod slab;

pub use addr::PhysicalAddress;
pub use boot_mem::{BootMemoryMap, UsableRange};
pub use config::KallocConfig;
pub use error::KallocError;
pub use free_list::{FrameCodec, Kmem, TaggedHead};
pub use kalloc::{Kalloc, KallocStats, PoolStats};
pub use page_info::PageInfo;
pub use phys_mapper::DirectMap;
pub use slab::{SlabKind, SlabSpec};
