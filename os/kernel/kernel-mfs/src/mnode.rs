//! # Memory nodes
//!
//! An [`MNode`] is the one in-memory instance of a filesystem node. It is
//! reached through its filesystem's weak cache and kept alive by [`Sref`]s
//! plus, while anything links to it, one self-reference (the cache pin):
//!
//! ```text
//!  nlink 0 ─link()─▶ 1 ─link()─▶ 2 …        pin taken on 0 → 1
//!        ◀─unlink()─   ◀─unlink()─          pin dropped on 1 → 0
//!
//!  refcount 0 ─▶ cleanup(cache) ─▶ retire ─▶ freed after a grace period
//! ```

use crate::backing_store::{BackingStore, NodeImage};
use crate::inum::{InodeNumber, MNodeType};
use crate::mdir::MDir;
use crate::mfile::MFile;
use crate::mfs::Mfs;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::hint::spin_loop;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_sync::{RefCount, Referenced, Sref, quiesce};
use log::trace;

/// Device node numbers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MDev {
    pub major: u16,
    pub minor: u16,
}

/// Socket node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MSock;

#[derive(Debug)]
pub enum MNodeKind {
    Dir(MDir),
    File(MFile),
    Dev(MDev),
    Sock(MSock),
}

impl MNodeKind {
    pub(crate) fn from_image(
        inum: InodeNumber,
        image: &NodeImage,
        store: &Arc<dyn BackingStore>,
    ) -> Self {
        match image.ty {
            MNodeType::Dir => Self::Dir(MDir::new()),
            MNodeType::File => Self::File(MFile::new(inum, image.size, Arc::clone(store))),
            MNodeType::Dev => Self::Dev(MDev {
                major: image.major,
                minor: image.minor,
            }),
            MNodeType::Sock => Self::Sock(MSock),
        }
    }

    #[must_use]
    pub const fn ty(&self) -> MNodeType {
        match self {
            Self::Dir(_) => MNodeType::Dir,
            Self::File(_) => MNodeType::File,
            Self::Dev(_) => MNodeType::Dev,
            Self::Sock(_) => MNodeType::Sock,
        }
    }
}

pub struct MNode {
    refcount: RefCount,
    fs: Arc<Mfs>,
    inum: InodeNumber,
    nlink: AtomicUsize,
    cache_pin: AtomicBool,
    valid: AtomicBool,
    kind: MNodeKind,
}

impl MNode {
    pub(crate) fn new(fs: Arc<Mfs>, inum: InodeNumber, nlink: usize, kind: MNodeKind) -> Self {
        Self {
            refcount: RefCount::new(),
            fs,
            inum,
            nlink: AtomicUsize::new(nlink),
            cache_pin: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            kind,
        }
    }

    #[inline]
    #[must_use]
    pub const fn inum(&self) -> InodeNumber {
        self.inum
    }

    #[inline]
    #[must_use]
    pub const fn ty(&self) -> MNodeType {
        self.kind.ty()
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> &MNodeKind {
        &self.kind
    }

    #[must_use]
    pub const fn fs(&self) -> &Arc<Mfs> {
        &self.fs
    }

    #[must_use]
    pub const fn as_dir(&self) -> Option<&MDir> {
        match &self.kind {
            MNodeKind::Dir(dir) => Some(dir),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_file(&self) -> Option<&MFile> {
        match &self.kind {
            MNodeKind::File(file) => Some(file),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_dev(&self) -> Option<&MDev> {
        match &self.kind {
            MNodeKind::Dev(dev) => Some(dev),
            _ => None,
        }
    }

    #[must_use]
    pub fn nlink(&self) -> usize {
        self.nlink.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.cache_pin.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    /// Spins until the node's construction has finished.
    pub fn wait_valid(&self) {
        while !self.is_valid() {
            spin_loop();
        }
    }

    /// Pins or unpins the node in the cache.
    ///
    /// Idempotent: only a transition takes (`true`) or releases (`false`)
    /// the node's reference to itself.
    pub fn cache_pin(&self, flag: bool) {
        if self
            .cache_pin
            .compare_exchange(!flag, flag, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if flag {
            // SAFETY: the caller's reference keeps the count above zero.
            let _ = Sref::into_raw(unsafe { Sref::newref(self) });
        } else {
            // SAFETY: the pin owned one unit of the count.
            drop(unsafe { Sref::from_raw(NonNull::from(self)) });
        }
        trace!("{}: cache_pin({flag})", self.inum);
    }

    /// Brings the pin in line with the link count.
    ///
    /// A link and an unlink crossing zero concurrently may toggle the pin in
    /// the wrong order; whoever toggles last re-reads the count afterwards
    /// and goes again if it moved.
    fn sync_pin(&self) {
        loop {
            let linked = self.nlink.load(Ordering::SeqCst) != 0;
            self.cache_pin(linked);
            if (self.nlink.load(Ordering::SeqCst) != 0) == linked {
                return;
            }
        }
    }

    /// Adds a link. A node coming back from zero links is pinned again.
    pub fn link(&self) {
        if self.nlink.fetch_add(1, Ordering::SeqCst) == 0 {
            self.sync_pin();
        }
    }

    /// Drops a link; the last one unpins the node.
    ///
    /// # Panics
    /// If the node has no links.
    pub fn unlink(&self) {
        let prev = self
            .nlink
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match prev {
            Err(_) => panic!("{}: link count underflow", self.inum),
            Ok(1) => self.sync_pin(),
            Ok(_) => {}
        }
    }
}

impl fmt::Debug for MNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MNode")
            .field("inum", &self.inum)
            .field("nlink", &self.nlink())
            .field("pinned", &self.is_pinned())
            .field("valid", &self.is_valid())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// SAFETY: mnodes are only created through `Sref::new` and reached through
// `Sref`s or the cache, which upgrades with `try_upgrade`.
unsafe impl Referenced for MNode {
    fn refcount(&self) -> &RefCount {
        &self.refcount
    }

    unsafe fn on_zero(this: NonNull<Self>) {
        let node = unsafe { this.as_ref() };
        node.fs.cache().cleanup(node.inum, this);
        node.fs.count_freed();
        trace!("{}: freed", node.inum);
        quiesce::retire(unsafe { Box::from_raw(this.as_ptr()) });
    }
}

/// A reference to a node that also owns one of its links.
///
/// Returned by [`Mfs::alloc`]; the link is what a directory entry holds.
/// Dropping a `LinkRef` gives the link back, [`commit`](Self::commit) hands
/// it over to the caller's bookkeeping instead.
pub struct LinkRef {
    node: Sref<MNode>,
    held: bool,
}

impl LinkRef {
    /// Wraps `node` and the link its caller already accounted for.
    pub(crate) const fn adopt(node: Sref<MNode>) -> Self {
        Self { node, held: true }
    }

    /// Takes a new link on `node`.
    #[must_use]
    pub fn acquire(node: Sref<MNode>) -> Self {
        node.link();
        Self::adopt(node)
    }

    #[must_use]
    pub const fn node(&self) -> &Sref<MNode> {
        &self.node
    }

    /// Keeps the link and returns the node's number; the caller now owns the
    /// link and gives it back with [`MNode::unlink`].
    #[must_use]
    pub fn commit(mut self) -> InodeNumber {
        self.held = false;
        self.node.inum()
    }
}

impl Deref for LinkRef {
    type Target = MNode;

    fn deref(&self) -> &MNode {
        &self.node
    }
}

impl Drop for LinkRef {
    fn drop(&mut self) {
        if self.held {
            self.node.unlink();
        }
    }
}

impl fmt::Debug for LinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRef")
            .field("node", &*self.node)
            .field("held", &self.held)
            .finish()
    }
}
