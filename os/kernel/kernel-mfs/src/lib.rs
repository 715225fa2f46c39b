//! # Memory Filesystem Nodes
//!
//! The canonical in-memory representation of filesystem nodes, shared by all
//! processors:
//!
//! * [`WeakCache`]: inode number → node, without keeping nodes alive.
//! * [`MNode`]: one node, reference counted, pinned in the cache while
//!   anything links to it; variants [`MDir`], [`MFile`], [`MDev`] and
//!   [`MSock`].
//! * [`MFile`]: byte size plus a sparse, range-locked page table of
//!   [`PageInfo`](kernel_alloc::PageInfo) references.
//! * [`Mfs`]: inode number allocation and the lookup path through the
//!   [`BackingStore`].
//!
//! ```rust,ignore
//! let fs = Mfs::volatile();
//! let root = fs.alloc(MNodeType::Dir);
//! let file = fs.alloc(MNodeType::File);
//! root.as_dir().unwrap().insert("motd", file)?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod backing_store;
mod error;
pub mod inum;
mod mdir;
mod mfile;
mod mfs;
mod mnode;
pub mod page_table;
pub mod weak_cache;

pub use backing_store::{BackingStore, NodeImage, UnimplementedStore};
pub use error::{AlreadyExists, MfsError, StoreError};
pub use inum::{InodeNumber, MNodeType};
pub use mdir::MDir;
pub use mfile::{MFile, Resizer, pages_for};
pub use mfs::{Mfs, MfsStats};
pub use mnode::{LinkRef, MDev, MNode, MNodeKind, MSock};
pub use weak_cache::{CacheKey, WeakCache, WeakCacheStats};
