//! # Sparse file page table
//!
//! A three-level radix tree of atomic page pointers, indexed by page number:
//!
//! ```text
//!  index = | top:9 | mid:9 | leaf:9 |
//!
//!  root ──▶ [512 × *Mid] ──▶ [512 × *Leaf] ──▶ [512 × *PageInfo]
//! ```
//!
//! Interior levels are installed on demand with a CAS and live as long as the
//! table. Leaf slots own one reference to their page each. Readers load slots
//! without locks; writers go through the striped range lock.

use alloc::boxed::Box;
use core::ops::Range;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use kernel_alloc::PageInfo;
use kernel_sync::{RangeGuard, Sref, StripedRangeLock};

const BITS: u32 = 9;
const FANOUT: usize = 1 << BITS;

/// Pages addressable by one table.
pub const MAX_PAGES: u64 = 1 << (3 * BITS);

struct Level<T> {
    slots: [AtomicPtr<T>; FANOUT],
}

type Leaf = Level<PageInfo>;
type Mid = Level<Leaf>;

impl<T> Level<T> {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; FANOUT],
        })
    }
}

impl<C> Level<Level<C>> {
    fn child(&self, i: usize) -> Option<&Level<C>> {
        let p = self.slots[i].load(Ordering::Acquire);
        // SAFETY: installed children live until the table drops.
        unsafe { p.as_ref() }
    }

    fn child_or_insert(&self, i: usize) -> &Level<C> {
        if let Some(child) = self.child(i) {
            return child;
        }
        let fresh = Box::into_raw(Level::new());
        match self.slots[i].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                drop(unsafe { Box::from_raw(fresh) });
                unsafe { &*winner }
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn split(index: u64) -> (usize, usize, usize) {
    let mask = FANOUT as u64 - 1;
    (
        (index >> (2 * BITS)) as usize,
        ((index >> BITS) & mask) as usize,
        (index & mask) as usize,
    )
}

pub struct PageTable {
    root: Box<Level<Mid>>,
    lock: StripedRangeLock,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Level::new(),
            // one stripe per leaf
            lock: StripedRangeLock::new(BITS),
        }
    }

    fn slot(&self, index: u64) -> Option<&AtomicPtr<PageInfo>> {
        if index >= MAX_PAGES {
            return None;
        }
        let (top, mid, leaf) = split(index);
        Some(&self.root.child(top)?.child(mid)?.slots[leaf])
    }

    /// # Panics
    /// If `index` is beyond [`MAX_PAGES`].
    fn slot_or_insert(&self, index: u64) -> &AtomicPtr<PageInfo> {
        assert!(index < MAX_PAGES, "page index {index} beyond file limit");
        let (top, mid, leaf) = split(index);
        &self.root.child_or_insert(top).child_or_insert(mid).slots[leaf]
    }

    /// Raw page pointer at `index`. Only dereferenceable inside a quiescent
    /// section or under the index's lock.
    #[must_use]
    pub fn get(&self, index: u64) -> Option<NonNull<PageInfo>> {
        NonNull::new(self.slot(index)?.load(Ordering::Acquire))
    }

    pub fn lock(&self, range: Range<u64>) -> RangeGuard<'_> {
        self.lock.lock(range)
    }

    pub fn lock_one(&self, index: u64) -> RangeGuard<'_> {
        self.lock.lock_one(index)
    }

    /// Stores `page` at `index`, returning the page it replaced.
    ///
    /// Callers hold the index's lock.
    pub fn fill(&self, index: u64, page: Sref<PageInfo>) -> Option<Sref<PageInfo>> {
        let new = Sref::into_raw(page).as_ptr();
        let old = self.slot_or_insert(index).swap(new, Ordering::AcqRel);
        // SAFETY: the slot owned one reference to `old`.
        NonNull::new(old).map(|old| unsafe { Sref::from_raw(old) })
    }

    /// Clears every slot in `range`, dropping the slots' references.
    ///
    /// Callers hold the range's lock. Missing subtrees are skipped whole.
    pub fn unset(&self, range: Range<u64>) {
        let span = FANOUT as u64;
        let mid_span = span * span;
        let mut index = range.start;
        let end = range.end.min(MAX_PAGES);
        while index < end {
            let (top, mid, _) = split(index);
            let Some(mid_level) = self.root.child(top) else {
                index = (index / mid_span + 1) * mid_span;
                continue;
            };
            let Some(leaf) = mid_level.child(mid) else {
                index = (index / span + 1) * span;
                continue;
            };
            let leaf_end = ((index / span + 1) * span).min(end);
            for i in index..leaf_end {
                let old = leaf.slots[split(i).2].swap(ptr::null_mut(), Ordering::AcqRel);
                if let Some(old) = NonNull::new(old) {
                    drop(unsafe { Sref::from_raw(old) });
                }
            }
            index = leaf_end;
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.unset(0..MAX_PAGES);
        for mid in &self.root.slots {
            let mid = mid.swap(ptr::null_mut(), Ordering::Acquire);
            if mid.is_null() {
                continue;
            }
            let mid = unsafe { Box::from_raw(mid) };
            for leaf in &mid.slots {
                let leaf = leaf.load(Ordering::Acquire);
                if !leaf.is_null() {
                    drop(unsafe { Box::from_raw(leaf) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_three_levels() {
        assert_eq!(split(0), (0, 0, 0));
        assert_eq!(split(513), (0, 1, 1));
        assert_eq!(split(MAX_PAGES - 1), (511, 511, 511));
    }

    #[test]
    fn empty_table_has_no_slots() {
        let table = PageTable::new();
        assert!(table.get(0).is_none());
        assert!(table.get(MAX_PAGES).is_none());
        assert!(table.slot(1 << 20).is_none());
        // Unsetting a missing subtree is a no-op.
        table.unset(0..MAX_PAGES);
    }

    #[test]
    fn interior_levels_are_shared() {
        let table = PageTable::new();
        let a = table.slot_or_insert(5) as *const _;
        assert_eq!(table.slot(5).map(|s| s as *const _), Some(a));
        assert!(table.slot(6).is_some(), "same leaf");
        assert!(table.slot(FANOUT as u64).is_none(), "next leaf not built");
    }
}
