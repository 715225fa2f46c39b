//! # Kernel Configuration and Boot Interface
//!
//! This crate is the single source of truth for the compile-time configuration
//! of the memory subsystem and for the shape of the data the loader hands to
//! the kernel before any allocator exists.
//!
//! ## Overview
//!
//! The physical page allocator, the slab pools and the mnode cache are all
//! sized at boot from constants that must agree across crates: the page size
//! used to align runs, the object sizes of every slab kind, the number of
//! objects carved per processor, the debug junk-fill bytes, and the maximum
//! processor count that bounds per-processor arrays. Keeping them here avoids
//! configuration drift between `kernel-alloc`, `kernel-sync` and `kernel-mfs`.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! * **Memory Regions**: the loader-provided list of physical ranges, each
//!   tagged usable or reserved
//! * **ABI Stability**: `#[repr(C)]` descriptors with fixed-size integers
//!
//! ### Memory Configuration ([`memory`])
//! * **Paging Granularity**: [`PAGE_SIZE`](memory::PAGE_SIZE) and its shift
//! * **Direct Map**: [`HHDM_BASE`](memory::HHDM_BASE) for physical access
//! * **Slab Geometry**: object size and preallocation count per slab kind
//! * **Debugging**: junk-fill patterns for freed and freshly allocated memory
//! * **Caches**: bucket count of the mnode cache
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │  ignored even if usable
//! PHYS_LOAD   ├─────────────────────────────────┤ 0x0010_0000 (1 MiB)
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤ reserved end
//!             │     PageInfo array              │
//!             ├─────────────────────────────────┤
//!             │  per-CPU slabs, per-CPU pages   │  carved at boot
//!             └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_info::memory::{PAGE_SIZE, KERNEL_STACK_SIZE};
//!
//! assert_eq!(KERNEL_STACK_SIZE % PAGE_SIZE, 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
