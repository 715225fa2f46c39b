//! # The in-memory filesystem object
//!
//! [`Mfs`] hands out inode numbers, builds mnodes and guarantees that each
//! inode number has at most one live [`MNode`]: every node goes through the
//! weak cache, both when it is created and when it is read back from the
//! backing store.

use crate::backing_store::{BackingStore, NodeImage, UnimplementedStore};
use crate::error::MfsError;
use crate::inum::{InodeNumber, MNodeType};
use crate::mnode::{LinkRef, MDev, MNode, MNodeKind};
use crate::weak_cache::{CacheKey, WeakCache, WeakCacheStats, mix64};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::{MAX_CPUS, MNODE_CACHE_BUCKETS};
use kernel_sync::{Sref, current_cpu};
use log::{info, trace};

impl CacheKey for InodeNumber {
    fn cache_hash(&self) -> u64 {
        mix64(self.into_bits())
    }
}

#[repr(align(64))]
struct SeqCounter(AtomicU64);

pub struct Mfs {
    cache: WeakCache<InodeNumber, MNode>,
    next_inum: [SeqCounter; MAX_CPUS],
    store: Arc<dyn BackingStore>,
    allocated: AtomicU64,
    loaded: AtomicU64,
    freed: AtomicU64,
}

impl Mfs {
    /// A filesystem backed by `store`, with `buckets` cache shards.
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, buckets: usize) -> Arc<Self> {
        Arc::new(Self {
            cache: WeakCache::new(buckets),
            next_inum: [const { SeqCounter(AtomicU64::new(0)) }; MAX_CPUS],
            store,
            allocated: AtomicU64::new(0),
            loaded: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        })
    }

    /// A memory-only filesystem with the kernel's cache size.
    #[must_use]
    pub fn volatile() -> Arc<Self> {
        Self::new(Arc::new(UnimplementedStore), MNODE_CACHE_BUCKETS)
    }

    pub(crate) const fn cache(&self) -> &WeakCache<InodeNumber, MNode> {
        &self.cache
    }

    pub(crate) fn count_freed(&self) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    fn next_inum(&self, ty: MNodeType) -> InodeNumber {
        let cpu = current_cpu();
        let seq = self.next_inum[cpu.as_usize()].0.fetch_add(1, Ordering::Relaxed);
        InodeNumber::compose(ty, cpu, seq)
    }

    /// Creates a node of type `ty`.
    ///
    /// The node starts out with one link, owned by the returned [`LinkRef`],
    /// and is pinned in the cache.
    ///
    /// # Panics
    /// If the fresh inode number is already cached.
    #[must_use]
    pub fn alloc(self: &Arc<Self>, ty: MNodeType) -> LinkRef {
        let inum = self.next_inum(ty);
        let kind = MNodeKind::from_image(inum, &NodeImage::new(ty, 1), &self.store);
        self.install_new(inum, kind)
    }

    /// Creates a device node.
    #[must_use]
    pub fn alloc_dev(self: &Arc<Self>, major: u16, minor: u16) -> LinkRef {
        let inum = self.next_inum(MNodeType::Dev);
        self.install_new(inum, MNodeKind::Dev(MDev { major, minor }))
    }

    fn install_new(self: &Arc<Self>, inum: InodeNumber, kind: MNodeKind) -> LinkRef {
        let node = Sref::new(MNode::new(Arc::clone(self), inum, 1, kind));
        if self.cache.insert(inum, &node).is_err() {
            panic!("mnode cache insert failed (duplicate {inum}?)");
        }
        node.cache_pin(true);
        node.mark_valid();
        self.allocated.fetch_add(1, Ordering::Relaxed);
        trace!("{inum}: allocated {:?}", node.ty());
        LinkRef::adopt(node)
    }

    /// The node numbered `inum`, read from the backing store if it is not
    /// in memory.
    ///
    /// A node that is still being constructed by another processor is
    /// waited for.
    ///
    /// # Errors
    /// [`MfsError::Store`] if the store cannot produce the node,
    /// [`MfsError::TypeMismatch`] if it produces a node of another type.
    pub fn get(self: &Arc<Self>, inum: InodeNumber) -> Result<Sref<MNode>, MfsError> {
        loop {
            if let Some(node) = self.cache.lookup(&inum) {
                node.wait_valid();
                return Ok(node);
            }

            let image = self.store.load_node(inum)?;
            if inum.ty() != Some(image.ty) {
                return Err(MfsError::TypeMismatch {
                    inum,
                    found: image.ty,
                });
            }
            let kind = MNodeKind::from_image(inum, &image, &self.store);
            let node = Sref::new(MNode::new(Arc::clone(self), inum, image.nlink, kind));
            if self.cache.insert(inum, &node).is_err() {
                // Someone else installed it first, or an old instance is
                // still being torn down.
                continue;
            }
            if image.nlink > 0 {
                node.cache_pin(true);
            }
            node.mark_valid();
            self.loaded.fetch_add(1, Ordering::Relaxed);
            return Ok(node);
        }
    }

    #[must_use]
    pub fn stats(&self) -> MfsStats {
        MfsStats {
            cache: self.cache.stats(),
            allocated: self.allocated.load(Ordering::Relaxed),
            loaded: self.loaded.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        let cache = stats.cache;
        info!("mnode cache:");
        info!("  {} items", cache.items);
        info!(
            "  {} used / {} total buckets ({}%)",
            cache.used_buckets,
            cache.total_buckets,
            cache.used_percent()
        );
        info!("  {} max chain length", cache.max_chain);
        info!("  {} avg chain length", cache.avg_chain());
        if let Some(avg) = cache.avg_used_chain() {
            info!("  {avg} avg used chain length");
        }
        info!(
            "  {} allocated, {} loaded, {} freed",
            stats.allocated, stats.loaded, stats.freed
        );
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MfsStats {
    pub cache: WeakCacheStats,
    pub allocated: u64,
    pub loaded: u64,
    pub freed: u64,
}
