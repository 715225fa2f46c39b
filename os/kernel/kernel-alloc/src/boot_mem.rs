//! # Boot memory map
//!
//! The loader hands over an unsorted list of [`BootMemoryRegion`]s. The
//! allocator only cares about conventional RAM at or above
//! [`LOW_MEMORY_END`], trimmed to whole pages, so that is all the map keeps:
//!
//! ```text
//!  loader regions            BootMemoryMap
//!  ┌──────────────────┐
//!  │ 0x0000 usable    │ ──▶ ignored (below 1 MiB)
//!  │ 0x10_0000 usable │ ──▶ [0x10_0000, 0x7fe_0000)
//!  │ 0x7fe_0000 rsvd  │ ──▶ dropped
//!  │ 0x1_0000_0000 us │ ──▶ [0x1_0000_0000, 0x2_0000_0000)
//!  └──────────────────┘
//! ```
//!
//! Carving walks the map with [`BootMemoryMap::next`], which steps inside a
//! range and hops to the base of the following range once a step runs off
//! the end.

use crate::addr::PhysicalAddress;
use crate::error::KallocError;
use alloc::vec::Vec;
use kernel_info::boot::{BootMemoryRegion, RegionKind};
use kernel_info::memory::{LOW_MEMORY_END, PAGE_SIZE};
use log::debug;

/// A page-aligned, half-open range of usable physical memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsableRange {
    base: PhysicalAddress,
    end: PhysicalAddress,
}

impl UsableRange {
    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.base.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.base <= pa && pa < self.end
    }
}

/// Ordered, disjoint usable ranges discovered at boot.
#[derive(Clone, Debug, Default)]
pub struct BootMemoryMap {
    ranges: Vec<UsableRange>,
}

impl BootMemoryMap {
    /// Builds the map from the loader's regions.
    ///
    /// # Errors
    /// [`KallocError::OverlappingRegions`] if two usable regions overlap after
    /// trimming.
    pub fn from_regions(regions: &[BootMemoryRegion]) -> Result<Self, KallocError> {
        let mut ranges = Vec::new();
        for region in regions {
            let usable = region.is_usable() && region.base >= LOW_MEMORY_END;
            debug!(
                "e820: {:#018x}-{:#018x} {}",
                region.base,
                region.end().saturating_sub(1),
                match region.kind {
                    RegionKind::Usable if usable => "usable",
                    RegionKind::Usable => "usable (ignored)",
                    RegionKind::Reserved => "reserved",
                }
            );
            if !usable {
                continue;
            }

            let base = PhysicalAddress::new(region.base).page_round_up();
            let end = PhysicalAddress::new(region.end()).page_round_down();
            if end > base {
                ranges.push(UsableRange { base, end });
            }
        }

        ranges.sort_unstable_by_key(UsableRange::base);
        if let Some(pair) = ranges.windows(2).find(|w| w[0].end > w[1].base) {
            return Err(KallocError::OverlappingRegions {
                first: pair[0].base,
                second: pair[1].base,
            });
        }

        let map = Self { ranges };
        debug!(
            "boot memory: {} MiB usable in {} ranges",
            map.total_bytes() >> 20,
            map.ranges.len()
        );
        Ok(map)
    }

    #[must_use]
    pub fn ranges(&self) -> &[UsableRange] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsableRange> {
        self.ranges.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        // Ranges are sorted and disjoint: the candidate is the last one
        // starting at or below `pa`.
        let idx = self.ranges.partition_point(|r| r.base <= pa).checked_sub(1)?;
        self.ranges[idx].contains(pa).then_some(idx)
    }

    /// The range holding `pa`.
    #[must_use]
    pub fn containing(&self, pa: PhysicalAddress) -> Option<&UsableRange> {
        self.index_of(pa).map(|idx| &self.ranges[idx])
    }

    /// Bytes from `pa` to the end of its range.
    #[must_use]
    pub fn size_at(&self, pa: PhysicalAddress) -> Option<u64> {
        self.containing(pa).map(|r| r.end - pa)
    }

    /// Steps `inc` bytes forward from `pa`.
    ///
    /// Returns `pa + inc` while that stays inside `pa`'s range, otherwise the
    /// base of the following range. `None` if `pa` is not usable memory or
    /// there is no following range.
    #[must_use]
    pub fn next(&self, pa: PhysicalAddress, inc: u64) -> Option<PhysicalAddress> {
        let idx = self.index_of(pa)?;
        let range = &self.ranges[idx];
        match pa.as_u64().checked_add(inc) {
            Some(stepped) if stepped < range.end.as_u64() => Some(PhysicalAddress::new(stepped)),
            _ => self.ranges.get(idx + 1).map(UsableRange::base),
        }
    }

    /// `pa` itself if usable, else the base of the first range above it.
    #[must_use]
    pub fn seek(&self, pa: PhysicalAddress) -> Option<PhysicalAddress> {
        if self.index_of(pa).is_some() {
            return Some(pa);
        }
        self.ranges.iter().find(|r| r.base > pa).map(UsableRange::base)
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(UsableRange::len).sum()
    }

    /// Usable bytes at or above `pa`.
    #[must_use]
    pub fn bytes_from(&self, pa: PhysicalAddress) -> u64 {
        self.ranges
            .iter()
            .filter(|r| r.end > pa)
            .map(|r| r.end - r.base.max(pa))
            .sum()
    }

    #[must_use]
    pub fn first_base(&self) -> Option<PhysicalAddress> {
        self.ranges.first().map(UsableRange::base)
    }

    /// Exclusive end of the highest range; zero for an empty map.
    #[must_use]
    pub fn max_end(&self) -> PhysicalAddress {
        self.ranges
            .last()
            .map_or(PhysicalAddress::zero(), UsableRange::end)
    }

    /// Number of pages between the lowest base and the highest end,
    /// holes included.
    #[must_use]
    pub fn span_pages(&self) -> u64 {
        self.first_base()
            .map_or(0, |base| (self.max_end() - base) / PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn map() -> BootMemoryMap {
        BootMemoryMap::from_regions(&[
            BootMemoryRegion::usable(8 * MIB, 4 * MIB),
            BootMemoryRegion::usable(0, 640 * 1024),
            BootMemoryRegion::reserved(4 * MIB, 4 * MIB),
            BootMemoryRegion::usable(2 * MIB + 100, 2 * MIB - 100),
        ])
        .unwrap()
    }

    #[test]
    fn keeps_high_usable_ranges_sorted_and_trimmed() {
        let m = map();
        let bases: Vec<_> = m.iter().map(|r| r.base().as_u64()).collect();
        assert_eq!(bases, [2 * MIB + PAGE_SIZE, 8 * MIB]);
        assert_eq!(m.ranges()[0].end().as_u64(), 4 * MIB);
        assert_eq!(m.total_bytes(), (2 * MIB - PAGE_SIZE) + 4 * MIB);
        assert_eq!(m.max_end().as_u64(), 12 * MIB);
    }

    #[test]
    fn next_steps_within_then_hops() {
        let m = map();
        let last = PhysicalAddress::new(4 * MIB - PAGE_SIZE);
        assert_eq!(
            m.next(PhysicalAddress::new(3 * MIB), PAGE_SIZE),
            Some(PhysicalAddress::new(3 * MIB + PAGE_SIZE))
        );
        assert_eq!(m.next(last, PAGE_SIZE), Some(PhysicalAddress::new(8 * MIB)));
        assert_eq!(m.next(PhysicalAddress::new(12 * MIB - PAGE_SIZE), PAGE_SIZE), None);
        assert_eq!(m.next(PhysicalAddress::new(5 * MIB), PAGE_SIZE), None);
    }

    #[test]
    fn size_and_search() {
        let m = map();
        assert_eq!(m.size_at(PhysicalAddress::new(11 * MIB)), Some(MIB));
        assert!(m.containing(PhysicalAddress::new(12 * MIB)).is_none());
        assert!(m.containing(PhysicalAddress::new(MIB)).is_none());
        assert_eq!(
            m.seek(PhysicalAddress::new(5 * MIB)),
            Some(PhysicalAddress::new(8 * MIB))
        );
        assert_eq!(m.bytes_from(PhysicalAddress::new(10 * MIB)), 2 * MIB);
    }

    #[test]
    fn rejects_overlap() {
        let err = BootMemoryMap::from_regions(&[
            BootMemoryRegion::usable(2 * MIB, 2 * MIB),
            BootMemoryRegion::usable(3 * MIB, 2 * MIB),
        ])
        .unwrap_err();
        assert!(matches!(err, KallocError::OverlappingRegions { .. }));
    }
}
