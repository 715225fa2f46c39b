//! # Striped range lock
//!
//! Index spaces that are mostly accessed lock-free (a file's page table) but
//! whose mutations must not interleave use a fixed array of spin locks. Index
//! `i` belongs to stripe `(i >> span_shift) % STRIPES`; locking a range takes
//! every stripe it touches in ascending stripe order, which keeps concurrent
//! range lockers deadlock free.

use crate::RawSpin;
use core::ops::Range;

/// Number of stripes; one bit each in a `u64` mask.
pub const STRIPES: usize = 64;

pub struct StripedRangeLock {
    stripes: [RawSpin; STRIPES],
    span_shift: u32,
}

impl Default for StripedRangeLock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl StripedRangeLock {
    /// Creates a lock where `1 << span_shift` consecutive indices share a stripe.
    #[must_use]
    pub const fn new(span_shift: u32) -> Self {
        Self {
            stripes: [const { RawSpin::new() }; STRIPES],
            span_shift,
        }
    }

    /// Locks every index in `range`. An empty range locks nothing.
    pub fn lock(&self, range: Range<u64>) -> RangeGuard<'_> {
        let mask = self.stripe_mask(&range);
        for (i, stripe) in self.stripes.iter().enumerate() {
            if mask & (1 << i) != 0 {
                stripe.lock();
            }
        }
        RangeGuard { lock: self, mask }
    }

    /// Locks the single index `index`.
    pub fn lock_one(&self, index: u64) -> RangeGuard<'_> {
        self.lock(index..index + 1)
    }

    fn stripe_mask(&self, range: &Range<u64>) -> u64 {
        if range.is_empty() {
            return 0;
        }
        let first = range.start >> self.span_shift;
        let last = (range.end - 1) >> self.span_shift;
        if last - first >= STRIPES as u64 - 1 {
            return u64::MAX;
        }
        (first..=last).fold(0, |mask, span| mask | 1 << (span % STRIPES as u64))
    }
}

/// Holds the stripes of a locked range until dropped.
pub struct RangeGuard<'a> {
    lock: &'a StripedRangeLock,
    mask: u64,
}

impl RangeGuard<'_> {
    /// Number of stripes held.
    #[must_use]
    pub const fn stripes_held(&self) -> u32 {
        self.mask.count_ones()
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        for (i, stripe) in self.lock.stripes.iter().enumerate().rev() {
            if self.mask & (1 << i) != 0 {
                unsafe { stripe.unlock() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_map_to_stripes() {
        let lock = StripedRangeLock::new(2);
        assert_eq!(lock.stripe_mask(&(0..4)), 0b1);
        assert_eq!(lock.stripe_mask(&(3..5)), 0b11);
        assert_eq!(lock.stripe_mask(&(5..5)), 0);
        assert_eq!(lock.stripe_mask(&(0..1 << 20)), u64::MAX);
        // span 64 wraps back onto stripe 0
        assert_eq!(lock.stripe_mask(&(63 * 4..65 * 4)), 1 << 63 | 1);
    }

    #[test]
    fn disjoint_stripes_do_not_block() {
        let lock = StripedRangeLock::new(0);
        let a = lock.lock(0..2);
        assert_eq!(a.stripes_held(), 2);
        let b = lock.lock_one(5);
        assert!(lock.stripes[1].is_locked());
        drop(a);
        assert!(!lock.stripes[1].is_locked());
        assert!(lock.stripes[5].is_locked());
        drop(b);
    }
}
