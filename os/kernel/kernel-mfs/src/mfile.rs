//! # File contents
//!
//! An [`MFile`] is a byte size plus a sparse [`PageTable`]. The pair only
//! changes through a [`Resizer`], one at a time, and in an order that keeps
//! every mapped page below the size:
//!
//! * shrinking unmaps the dropped pages, then lowers the size;
//! * appending maps the new page, then raises the size.
//!
//! Both run under the page range's lock. [`MFile::get_page`] reads without
//! locks, inside a quiescent section, so a concurrent truncation cannot
//! return the page to the allocator between the slot load and the
//! reference upgrade.

use crate::backing_store::BackingStore;
use crate::error::MfsError;
use crate::inum::InodeNumber;
use crate::page_table::PageTable;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_alloc::PageInfo;
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::{SpinLock, SpinLockGuard, Sref, quiesce};
use log::trace;

/// Pages needed to hold `size` bytes.
#[inline]
#[must_use]
pub const fn pages_for(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE)
}

pub struct MFile {
    inum: InodeNumber,
    size: AtomicU64,
    pages: PageTable,
    resize: SpinLock<()>,
    store: Arc<dyn BackingStore>,
}

impl MFile {
    pub(crate) fn new(inum: InodeNumber, size: u64, store: Arc<dyn BackingStore>) -> Self {
        Self {
            inum,
            size: AtomicU64::new(size),
            pages: PageTable::new(),
            resize: SpinLock::new(()),
            store,
        }
    }

    /// Logical size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn page_count(&self) -> u64 {
        pages_for(self.size())
    }

    /// Exclusive access to size changes.
    pub fn resizer(&self) -> Resizer<'_> {
        Resizer {
            file: self,
            _serial: self.resize.lock(),
        }
    }

    /// The page backing page index `index`.
    ///
    /// A missing page below the page count is a hole and is asked of the
    /// backing store, which may fill it in. Past the end, `Ok(None)`.
    ///
    /// # Errors
    /// [`MfsError::Store`] if the store fails to read a hole.
    pub fn get_page(&self, index: u64) -> Result<Option<Sref<PageInfo>>, MfsError> {
        let mapped = {
            let _section = quiesce::enter();
            self.pages
                .get(index)
                // SAFETY: a slot's page is only released after a grace
                // period, and we are inside a section.
                .and_then(|raw| unsafe { Sref::try_upgrade(raw) })
        };
        if mapped.is_some() {
            return Ok(mapped);
        }
        if index >= self.page_count() {
            return Ok(None);
        }

        let Some(page) = self.store.load_page(self.inum, index)? else {
            return Ok(None);
        };
        Ok(self.populate(index, page))
    }

    /// Maps a page read for a hole, unless someone else mapped one first or
    /// the file shrank meanwhile.
    fn populate(&self, index: u64, page: Sref<PageInfo>) -> Option<Sref<PageInfo>> {
        let _slot = self.pages.lock_one(index);
        if index >= self.page_count() {
            return None;
        }
        if let Some(raw) = self.pages.get(index) {
            // SAFETY: slots only change under the lock we hold.
            return unsafe { Sref::try_upgrade(raw) };
        }
        let replaced = self.pages.fill(index, page.clone());
        debug_assert!(replaced.is_none());
        trace!("{}: populated page {index}", self.inum);
        Some(page)
    }
}

impl fmt::Debug for MFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MFile")
            .field("inum", &self.inum)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

/// Serialises size changes of one [`MFile`].
pub struct Resizer<'a> {
    file: &'a MFile,
    _serial: SpinLockGuard<'a, ()>,
}

impl Resizer<'_> {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Shrinks the file (or changes its size within the last page).
    ///
    /// # Panics
    /// If `newsize` needs more pages than the current size.
    pub fn resize_nogrow(&mut self, newsize: u64) {
        let file = self.file;
        let oldsize = file.size();
        let (new_pages, old_pages) = (pages_for(newsize), pages_for(oldsize));
        assert!(
            new_pages <= old_pages,
            "resize_nogrow: {newsize} bytes needs more pages than {oldsize}"
        );

        let _range = file.pages.lock(new_pages..old_pages);
        file.pages.unset(new_pages..old_pages);
        file.size.store(newsize, Ordering::Release);
        trace!("{}: size {oldsize} -> {newsize}", file.inum);
    }

    /// Grows the file by exactly one page, mapped to `page`.
    ///
    /// # Panics
    /// If `newsize` does not need exactly one page more than the current
    /// size.
    pub fn resize_append(&mut self, newsize: u64, page: Sref<PageInfo>) {
        let file = self.file;
        let oldsize = file.size();
        let index = pages_for(oldsize);
        assert!(
            index + 1 == pages_for(newsize),
            "resize_append: {oldsize} -> {newsize} is not a one-page append"
        );

        let _slot = file.pages.lock_one(index);
        let replaced = file.pages.fill(index, page);
        debug_assert!(replaced.is_none(), "page mapped past the end");
        file.size.store(newsize, Ordering::Release);
        trace!("{}: size {oldsize} -> {newsize}", file.inum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::PAGE_SHIFT;

    #[test]
    fn page_rounding() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(pages_for(5 << PAGE_SHIFT), 5);
    }
}
