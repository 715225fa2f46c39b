//! # Strong references with a last-reference hook
//!
//! [`Sref<T>`] is the counted handle every shared object of the memory
//! subsystem is passed around with. Unlike `Arc`, the object decides what
//! happens when its count reaches zero ([`Referenced::on_zero`]): an mnode
//! unhooks itself from the weak cache, a page's metadata returns the page to
//! the allocator. Either way the memory is reclaimed through
//! [`quiesce`](crate::quiesce), so a reader that loaded a raw pointer inside a
//! [`QuiescentGuard`](crate::QuiescentGuard) section can still attempt
//! [`Sref::try_upgrade`] safely after the count dropped to zero.

use crate::quiesce;
use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering, fence};

/// Strong reference count embedded in a [`Referenced`] object.
pub struct RefCount {
    count: AtomicUsize,
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCount {
    /// A count of one, owned by whoever constructs the object.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// A count of zero, for objects that live in a preallocated table and
    /// are brought to life with [`revive`](Self::revive).
    #[must_use]
    pub const fn dead() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Takes a dead object back to a count of one.
    ///
    /// # Panics
    /// If the object is still referenced.
    pub fn revive(&self) {
        let revived = self
            .count
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed);
        assert!(revived.is_ok(), "revive of a live object");
    }

    #[inline]
    fn inc(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(prev, 0, "newref on a dead object");
    }

    #[inline]
    fn try_inc(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Returns `true` when this was the last reference.
    #[inline]
    fn dec(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        assert_ne!(prev, 0, "refcount underflow");
        if prev == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

/// An object managed by [`Sref`].
///
/// # Safety
/// Implementors must only be reachable through [`Sref`] handles (or raw
/// pointers that are upgraded with [`Sref::try_upgrade`]), and `refcount`
/// must always return the same counter.
pub unsafe trait Referenced: Send + Sync + Sized + 'static {
    fn refcount(&self) -> &RefCount;

    /// Invoked once per transition of the count to zero.
    ///
    /// The default assumes the object was allocated by [`Sref::new`] and
    /// retires the allocation through the kernel-wide quiescence domain.
    ///
    /// # Safety
    /// `this` must point to an object whose count just reached zero.
    unsafe fn on_zero(this: NonNull<Self>) {
        quiesce::retire(unsafe { Box::from_raw(this.as_ptr()) });
    }
}

/// Strong reference to a [`Referenced`] object.
pub struct Sref<T: Referenced> {
    ptr: NonNull<T>,
    _owns: PhantomData<T>,
}

// Safety: Referenced requires Send + Sync; the count is atomic.
unsafe impl<T: Referenced> Send for Sref<T> {}
unsafe impl<T: Referenced> Sync for Sref<T> {}

impl<T: Referenced> Sref<T> {
    /// Moves `value` to the heap and adopts its initial reference.
    pub fn new(value: T) -> Self {
        debug_assert_eq!(value.refcount().get(), 1);
        Self {
            ptr: NonNull::from(Box::leak(Box::new(value))),
            _owns: PhantomData,
        }
    }

    /// Adopts a reference previously leaked with [`into_raw`](Self::into_raw)
    /// or otherwise accounted for in the count.
    ///
    /// # Safety
    /// `ptr` must point to a live object and the caller must own one unit of
    /// its count.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _owns: PhantomData,
        }
    }

    /// Leaks the handle, keeping its unit of the count.
    #[must_use]
    pub fn into_raw(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        core::mem::forget(this);
        ptr
    }

    /// Takes an additional reference to an object the caller can already see.
    ///
    /// # Safety
    /// `value` must be managed by `Sref` and currently have a non-zero count.
    #[must_use]
    pub unsafe fn newref(value: &T) -> Self {
        value.refcount().inc();
        Self {
            ptr: NonNull::from(value),
            _owns: PhantomData,
        }
    }

    /// Takes a reference unless the object is already on its way out.
    ///
    /// # Safety
    /// `ptr` must stay dereferenceable for the duration of the call, e.g.
    /// because it was loaded inside a quiescent section or under a lock that
    /// the zero hook also takes.
    #[must_use]
    pub unsafe fn try_upgrade(ptr: NonNull<T>) -> Option<Self> {
        let value = unsafe { ptr.as_ref() };
        value.refcount().try_inc().then(|| Self {
            ptr,
            _owns: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }

    #[inline]
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Current strong count; racy by nature, for diagnostics and tests.
    #[must_use]
    pub fn count(this: &Self) -> usize {
        this.refcount().get()
    }
}

impl<T: Referenced> Clone for Sref<T> {
    fn clone(&self) -> Self {
        self.refcount().inc();
        Self {
            ptr: self.ptr,
            _owns: PhantomData,
        }
    }
}

impl<T: Referenced> Drop for Sref<T> {
    fn drop(&mut self) {
        if self.refcount().dec() {
            unsafe { T::on_zero(self.ptr) }
        }
    }
}

impl<T: Referenced> Deref for Sref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we own a unit of the count, so the object is alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Referenced + fmt::Debug> fmt::Debug for Sref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Tracked {
        rc: RefCount,
        value: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(rc: RefCount, value: u32) -> (Self, Arc<AtomicUsize>) {
            let drops = Arc::new(AtomicUsize::new(0));
            let tracked = Self {
                rc,
                value,
                drops: Arc::clone(&drops),
            };
            (tracked, drops)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe impl Referenced for Tracked {
        fn refcount(&self) -> &RefCount {
            &self.rc
        }

        unsafe fn on_zero(this: NonNull<Self>) {
            drop(unsafe { Box::from_raw(this.as_ptr()) });
        }
    }

    #[test]
    fn clone_and_drop_balance() {
        let (tracked, drops) = Tracked::new(RefCount::new(), 7);
        let a = Sref::new(tracked);
        let b = a.clone();
        assert_eq!(Sref::count(&a), 2);
        assert_eq!(b.value, 7);
        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upgrade_fails_once_dead() {
        let rc = RefCount::dead();
        assert!(!rc.try_inc());
        rc.revive();
        assert!(rc.try_inc());
        assert_eq!(rc.get(), 2);
    }

    #[test]
    fn failed_upgrade_leaves_a_dead_object_untouched() {
        let (tracked, drops) = Tracked::new(RefCount::dead(), 3);
        let ptr = NonNull::from(Box::leak(Box::new(tracked)));

        for _ in 0..3 {
            assert!(unsafe { Sref::try_upgrade(ptr) }.is_none());
        }
        let tracked = unsafe { ptr.as_ref() };
        assert_eq!(tracked.rc.get(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        tracked.rc.revive();
        let live = unsafe { Sref::try_upgrade(ptr) }.expect("revived");
        assert_eq!(Sref::count(&live), 2);
        assert_eq!(live.value, 3);

        drop(live);
        // the unit taken by `revive`
        drop(unsafe { Sref::from_raw(ptr) });
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raw_round_trip_keeps_the_count() {
        let (tracked, _drops) = Tracked::new(RefCount::new(), 1);
        let a = Sref::new(tracked);
        let raw = Sref::into_raw(a.clone());
        assert_eq!(Sref::count(&a), 2);
        let back = unsafe { Sref::from_raw(raw) };
        assert!(Sref::ptr_eq(&a, &back));
        drop(back);
        assert_eq!(Sref::count(&a), 1);
    }
}
