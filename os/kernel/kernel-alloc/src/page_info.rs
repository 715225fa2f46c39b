//! # Per-page metadata
//!
//! One [`PageInfo`] per page following the metadata table, placed by
//! [`Kalloc::init`]. A `PageInfo` is reference counted: handing a page to
//! shared structures (a file's page table) goes through
//! [`Kalloc::alloc_page_ref`], and the page returns to the allocator once the
//! last [`Sref`] is gone *and* a grace period has passed, so lock-free readers
//! that loaded the pointer earlier can still fail their upgrade safely.

use crate::addr::PhysicalAddress;
use crate::kalloc::Kalloc;
use core::fmt;
use core::ptr::NonNull;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};
use kernel_sync::{RefCount, Referenced, Sref, quiesce};
use log::warn;

/// Metadata of one physical page.
pub struct PageInfo {
    refcount: RefCount,
    owner: &'static Kalloc,
}

impl PageInfo {
    const fn new(owner: &'static Kalloc) -> Self {
        Self {
            refcount: RefCount::dead(),
            owner,
        }
    }

    /// Physical address of the page this entry describes.
    #[must_use]
    pub fn page(&self) -> PhysicalAddress {
        self.owner
            .page_info_table()
            .map_or(PhysicalAddress::zero(), |table| table.page_of(self))
    }

    /// Direct-map pointer to the page.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.owner.direct().p2v(self.page())
    }

    /// Whether the page is currently handed out through [`Sref`]s.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.refcount.get() != 0
    }
}

impl fmt::Debug for PageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageInfo")
            .field("page", &self.page())
            .field("refs", &self.refcount.get())
            .finish()
    }
}

// SAFETY: entries live in the table for the kernel's lifetime and are only
// revived through `Kalloc::alloc_page_ref`.
unsafe impl Referenced for PageInfo {
    fn refcount(&self) -> &RefCount {
        &self.refcount
    }

    unsafe fn on_zero(this: NonNull<Self>) {
        // The entry itself stays in the table; only the page goes back.
        let info = unsafe { this.as_ref() };
        let owner = info.owner;
        let page = info.page();
        quiesce::defer(move || {
            if let Some(block) = owner.direct().p2v_nonnull(page) {
                // SAFETY: the last reference is gone and every reader that
                // could have seen it has left its section.
                unsafe { owner.free(block) };
            }
        });
    }
}

/// The metadata table and the first page it describes.
pub(crate) struct PageInfoTable {
    base: PhysicalAddress,
    entries: &'static [PageInfo],
}

impl PageInfoTable {
    /// Writes `len` dead entries at `at`.
    ///
    /// # Safety
    /// `at` must be valid for writes of `len` entries, suitably aligned, and
    /// never reused for anything else.
    pub(crate) unsafe fn build(
        at: *mut PageInfo,
        len: usize,
        base: PhysicalAddress,
        owner: &'static Kalloc,
    ) -> Self {
        for i in 0..len {
            unsafe { at.add(i).write(PageInfo::new(owner)) };
        }
        Self {
            base,
            entries: unsafe { core::slice::from_raw_parts(at, len) },
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn get(&self, pa: PhysicalAddress) -> Option<&'static PageInfo> {
        if pa < self.base {
            return None;
        }
        self.entries.get(((pa - self.base) >> PAGE_SHIFT) as usize)
    }

    fn page_of(&self, info: &PageInfo) -> PhysicalAddress {
        let offset = core::ptr::from_ref(info).addr() - self.entries.as_ptr().addr();
        self.base + (offset / size_of::<PageInfo>()) as u64 * PAGE_SIZE
    }

    #[must_use]
    pub(crate) const fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Kalloc {
    /// Metadata of the page at `pa`, if it is covered by the table.
    #[must_use]
    pub fn page_info(&self, pa: PhysicalAddress) -> Option<&'static PageInfo> {
        self.page_info_table()?.get(pa.page_round_down())
    }

    /// Number of pages the metadata table covers.
    #[must_use]
    pub fn page_info_len(&self) -> usize {
        self.page_info_table().map_or(0, PageInfoTable::len)
    }

    /// Allocates a page and returns its metadata holding the only reference.
    #[must_use]
    pub fn alloc_page_ref(&'static self, name: Option<&str>) -> Option<Sref<PageInfo>> {
        let page = self.alloc(name)?;
        let Some(info) = self.page_info(self.direct().v2p(page.as_ptr())) else {
            warn!("kalloc: page {page:p} has no metadata");
            unsafe { self.free(page) };
            return None;
        };
        info.refcount.revive();
        // SAFETY: the count was just taken from zero to one on our behalf.
        Some(unsafe { Sref::from_raw(NonNull::from(info)) })
    }
}
