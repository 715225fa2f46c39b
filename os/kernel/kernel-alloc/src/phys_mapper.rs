//! # Direct map
//!
//! Every usable physical page is visible to the kernel at `HHDM_BASE + pa`.
//! [`DirectMap`] turns physical addresses into pointers the allocator can
//! write free-list links and junk patterns through, and back.
//!
//! Hosted builds describe heap memory as "physical" and use
//! [`DirectMap::identity`].

use crate::addr::PhysicalAddress;
use core::ptr::NonNull;
use kernel_info::memory::HHDM_BASE;

/// Constant-offset physical ↔ virtual translation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The kernel's higher-half direct map.
    #[must_use]
    pub const fn hhdm() -> Self {
        Self::new(HHDM_BASE)
    }

    #[must_use]
    pub const fn identity() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Virtual address of `pa`.
    ///
    /// The pointer is only dereferenceable if `pa` is covered by the map.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn p2v(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(pa.as_u64().wrapping_add(self.offset) as usize)
    }

    /// Like [`p2v`](Self::p2v), for addresses known not to map to null.
    #[inline]
    #[must_use]
    pub fn p2v_nonnull(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        NonNull::new(self.p2v(pa))
    }

    /// Physical address behind a direct-map pointer.
    #[inline]
    #[must_use]
    pub fn v2p<T>(&self, va: *const T) -> PhysicalAddress {
        PhysicalAddress::new((va.expose_provenance() as u64).wrapping_sub(self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhdm_round_trip() {
        let map = DirectMap::hhdm();
        let pa = PhysicalAddress::new(0x20_0000);
        let va = map.p2v(pa);
        assert_eq!(va as u64, HHDM_BASE + 0x20_0000);
        assert_eq!(map.v2p(va), pa);
    }

    #[test]
    fn identity_is_a_no_op() {
        let value = 7u64;
        let map = DirectMap::identity();
        let pa = map.v2p(&raw const value);
        assert_eq!(map.p2v(pa).cast_const().cast::<u64>(), &raw const value);
    }
}
