//! # Backing store seam
//!
//! Where an mnode or a file page that is not in memory would come from. The
//! kernel has no on-disk format yet; [`UnimplementedStore`] stands in and
//! halts on node loads.

use crate::error::StoreError;
use crate::inum::{InodeNumber, MNodeType};
use kernel_alloc::PageInfo;
use kernel_sync::Sref;

/// What a store knows about a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeImage {
    pub ty: MNodeType,
    /// Directory entries naming the node.
    pub nlink: usize,
    /// Byte size, for files.
    pub size: u64,
    /// Device numbers, for device nodes.
    pub major: u16,
    pub minor: u16,
}

impl NodeImage {
    #[must_use]
    pub const fn new(ty: MNodeType, nlink: usize) -> Self {
        Self {
            ty,
            nlink,
            size: 0,
            major: 0,
            minor: 0,
        }
    }

    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub const fn with_device(mut self, major: u16, minor: u16) -> Self {
        self.major = major;
        self.minor = minor;
        self
    }
}

pub trait BackingStore: Send + Sync {
    /// Reads node `inum`.
    ///
    /// # Errors
    /// [`StoreError`] if the node cannot be read.
    fn load_node(&self, inum: InodeNumber) -> Result<NodeImage, StoreError>;

    /// Reads page `index` of file `inum`; `Ok(None)` for a hole.
    ///
    /// # Errors
    /// [`StoreError`] if the page cannot be read.
    fn load_page(&self, inum: InodeNumber, index: u64)
    -> Result<Option<Sref<PageInfo>>, StoreError>;
}

/// Memory-only filesystems: nothing to read back.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnimplementedStore;

impl BackingStore for UnimplementedStore {
    fn load_node(&self, inum: InodeNumber) -> Result<NodeImage, StoreError> {
        panic!("read in from disk not implemented ({inum})");
    }

    fn load_page(
        &self,
        _inum: InodeNumber,
        _index: u64,
    ) -> Result<Option<Sref<PageInfo>>, StoreError> {
        Ok(None)
    }
}
