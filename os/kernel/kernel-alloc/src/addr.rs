//! # Physical addresses
//!
//! Pages handed out by the allocator are virtual pointers into the direct
//! map; everything that is bookkept per physical page (the boot memory map,
//! free-list links, page metadata) is keyed by [`PhysicalAddress`] instead so
//! the two cannot be mixed up.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};
use kernel_info::memory::PAGE_SIZE;

/// Physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Rounds up to the next page boundary, saturating at the last page.
    #[inline]
    #[must_use]
    pub const fn page_round_up(self) -> Self {
        match self.0.checked_add(PAGE_SIZE - 1) {
            Some(v) => Self(v & !(PAGE_SIZE - 1)),
            None => Self(u64::MAX & !(PAGE_SIZE - 1)),
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Distance in bytes between two addresses.
impl Sub for PhysicalAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

/// Rounds a byte count down to whole pages.
#[inline]
#[must_use]
pub const fn page_round_down(bytes: u64) -> u64 {
    bytes & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        let pa = PhysicalAddress::new(0x1234);
        assert_eq!(pa.page_round_down().as_u64(), 0x1000);
        assert_eq!(pa.page_round_up().as_u64(), 0x2000);
        assert!(PhysicalAddress::new(0x3000).is_page_aligned());
        assert_eq!(PhysicalAddress::new(0x3000).page_round_up().as_u64(), 0x3000);
        assert_eq!(page_round_down(3 * PAGE_SIZE + 17), 3 * PAGE_SIZE);
    }

    #[test]
    fn round_up_saturates() {
        let top = PhysicalAddress::new(u64::MAX - 3);
        assert!(top.page_round_up().is_page_aligned());
    }

    #[test]
    fn formatting() {
        let pa = PhysicalAddress::new(0xdead_b000);
        assert_eq!(format!("{pa}"), "0x00000000DEADB000");
        assert_eq!(format!("{pa:?}"), "PA(0x00000000DEADB000)");
    }
}
