//! # Weak-reference cache
//!
//! Maps keys to objects without keeping them alive. An entry holds a raw
//! pointer; [`lookup`](WeakCache::lookup) turns it into an [`Sref`] only if
//! the object's count is still non-zero. Entries disappear when the object
//! itself calls [`cleanup`](WeakCache::cleanup) from its zero hook.
//!
//! ```text
//!  shard = hash(key) & mask
//!  ┌────────┐
//!  │ shard0 │──▶ (k1, *v1) ──▶ (k9, *v9)
//!  │ shard1 │
//!  │ shard2 │──▶ (k4, *v4)
//!  └────────┘
//! ```
//!
//! Lookups take no locks: they walk a shard's chain of atomic links inside a
//! quiescent section. Writers (`insert`, `cleanup`) serialize per shard, and
//! an unlinked chain node is retired, not freed, so a concurrent walker can
//! finish its step. Values must likewise be retired through
//! [`quiesce`] after their `cleanup`.
//!
//! The cache never evicts a live object on its own.

use crate::error::AlreadyExists;
use alloc::boxed::Box;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use kernel_sync::{Referenced, SpinLock, Sref, quiesce};

/// Keys of a [`WeakCache`].
pub trait CacheKey: Copy + Eq + Send + Sync + 'static {
    fn cache_hash(&self) -> u64;
}

/// 64-bit finalizer; spreads sequential identifiers over all shards.
#[must_use]
pub const fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl CacheKey for u64 {
    fn cache_hash(&self) -> u64 {
        mix64(*self)
    }
}

struct Node<K, V> {
    key: K,
    value: NonNull<V>,
    next: AtomicPtr<Node<K, V>>,
}

// SAFETY: a node only carries a pointer to a `Referenced` value, which is
// `Send + Sync`.
unsafe impl<K: CacheKey, V: Referenced> Send for Node<K, V> {}

struct Shard<K, V> {
    head: AtomicPtr<Node<K, V>>,
    writer: SpinLock<()>,
}

impl<K, V> Shard<K, V> {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            writer: SpinLock::new(()),
        }
    }
}

/// Iterates a chain. The caller keeps nodes alive, either inside a quiescent
/// section or holding the shard's writer lock.
struct Chain<'a, K, V> {
    link: &'a AtomicPtr<Node<K, V>>,
}

impl<'a, K, V> Iterator for Chain<'a, K, V> {
    type Item = (&'a AtomicPtr<Node<K, V>>, &'a Node<K, V>);

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.link;
        // SAFETY: see the type's contract.
        let node = unsafe { link.load(Ordering::Acquire).as_ref()? };
        self.link = &node.next;
        Some((link, node))
    }
}

pub struct WeakCache<K: CacheKey, V: Referenced> {
    shards: Box<[Shard<K, V>]>,
    mask: u64,
}

// SAFETY: chains only carry pointers to `Referenced` objects, which are
// `Send + Sync`; links are atomic and writers serialize per shard.
unsafe impl<K: CacheKey, V: Referenced> Send for WeakCache<K, V> {}
unsafe impl<K: CacheKey, V: Referenced> Sync for WeakCache<K, V> {}

impl<K: CacheKey, V: Referenced> WeakCache<K, V> {
    /// Creates a cache with `shards` buckets, rounded up to a power of two.
    #[must_use]
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        Self {
            shards: (0..shards).map(|_| Shard::new()).collect(),
            mask: shards as u64 - 1,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[(key.cache_hash() & self.mask) as usize]
    }

    fn chain(shard: &Shard<K, V>) -> Chain<'_, K, V> {
        Chain { link: &shard.head }
    }

    /// A strong reference to the object cached under `key`.
    ///
    /// An object whose count already dropped to zero is on its way out and
    /// reads as a miss.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<Sref<V>> {
        let _section = quiesce::enter();
        let (_, node) = Self::chain(self.shard(key)).find(|(_, n)| n.key == *key)?;
        // SAFETY: the value is retired only after its entry is unlinked, and
        // we are inside a section that began before that.
        unsafe { Sref::try_upgrade(node.value) }
    }

    /// Caches `value` under `key` without taking a reference.
    ///
    /// # Errors
    /// [`AlreadyExists`] if `key` is present, even if its object is
    /// mid-teardown.
    pub fn insert(&self, key: K, value: &Sref<V>) -> Result<(), AlreadyExists> {
        let shard = self.shard(&key);
        let _writer = shard.writer.lock();
        if Self::chain(shard).any(|(_, n)| n.key == key) {
            return Err(AlreadyExists);
        }
        let node = Box::into_raw(Box::new(Node {
            key,
            value: Sref::as_ptr(value),
            next: AtomicPtr::new(shard.head.load(Ordering::Relaxed)),
        }));
        shard.head.store(node, Ordering::Release);
        Ok(())
    }

    /// Drops the entry for `key` if it still refers to `value`.
    ///
    /// Called once from the object's zero hook. Returns whether an entry was
    /// removed; a loser of an insert race finds its key owned by someone
    /// else and removes nothing.
    pub fn cleanup(&self, key: K, value: NonNull<V>) -> bool {
        let shard = self.shard(&key);
        let _writer = shard.writer.lock();
        let found = Self::chain(shard).find(|(_, n)| n.key == key && n.value == value);
        let Some((link, node)) = found else {
            return false;
        };
        let unlinked = ptr::from_ref(node).cast_mut();
        link.store(node.next.load(Ordering::Relaxed), Ordering::Release);
        // SAFETY: the node is off the chain; walkers that still see it are
        // inside sections.
        quiesce::retire(unsafe { Box::from_raw(unlinked) });
        true
    }

    /// Occupancy snapshot. Shards are visited one at a time, so concurrent
    /// updates may be half reflected.
    #[must_use]
    pub fn stats(&self) -> WeakCacheStats {
        let mut stats = WeakCacheStats {
            total_buckets: self.shards.len(),
            ..WeakCacheStats::default()
        };
        for shard in &self.shards {
            let len = {
                let _writer = shard.writer.lock();
                Self::chain(shard).count()
            };
            stats.items += len;
            stats.used_buckets += usize::from(len != 0);
            stats.max_chain = stats.max_chain.max(len);
        }
        stats
    }
}

impl<K: CacheKey, V: Referenced> Drop for WeakCache<K, V> {
    fn drop(&mut self) {
        for shard in &*self.shards {
            let mut node = shard.head.swap(ptr::null_mut(), Ordering::Acquire);
            while !node.is_null() {
                // SAFETY: `&mut self`; no walker or writer is left.
                let owned = unsafe { Box::from_raw(node) };
                node = owned.next.load(Ordering::Relaxed);
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WeakCacheStats {
    pub items: usize,
    pub used_buckets: usize,
    pub total_buckets: usize,
    pub max_chain: usize,
}

impl WeakCacheStats {
    #[must_use]
    pub const fn used_percent(&self) -> usize {
        if self.total_buckets == 0 {
            0
        } else {
            self.used_buckets * 100 / self.total_buckets
        }
    }

    #[must_use]
    pub const fn avg_chain(&self) -> usize {
        if self.total_buckets == 0 {
            0
        } else {
            self.items / self.total_buckets
        }
    }

    /// Average chain length over non-empty buckets.
    #[must_use]
    pub const fn avg_used_chain(&self) -> Option<usize> {
        if self.used_buckets == 0 {
            None
        } else {
            Some(self.items / self.used_buckets)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_sync::RefCount;

    struct Obj {
        rc: RefCount,
        id: u64,
    }

    // Test objects are leaked instead of retired; only the count matters.
    unsafe impl Referenced for Obj {
        fn refcount(&self) -> &RefCount {
            &self.rc
        }

        unsafe fn on_zero(_this: NonNull<Self>) {}
    }

    fn obj(id: u64) -> Sref<Obj> {
        Sref::new(Obj {
            rc: RefCount::new(),
            id,
        })
    }

    #[test]
    fn lookup_upgrades_until_the_count_drops() {
        let cache = WeakCache::<u64, Obj>::new(8);
        let a = obj(1);
        cache.insert(1, &a).unwrap();

        let found = cache.lookup(&1).unwrap();
        assert!(Sref::ptr_eq(&found, &a));
        assert_eq!(found.id, 1);
        assert_eq!(Sref::count(&a), 2, "lookup takes a reference");
        drop(found);

        let raw = Sref::as_ptr(&a);
        drop(a);
        // Still listed, but dead: a miss.
        assert!(cache.lookup(&1).is_none());
        assert!(cache.cleanup(1, raw));
        assert!(cache.lookup(&1).is_none());
        assert_eq!(cache.stats().items, 0);
    }

    #[test]
    fn duplicate_insert_fails() {
        let cache = WeakCache::<u64, Obj>::new(4);
        let (a, b) = (obj(1), obj(2));
        cache.insert(7, &a).unwrap();
        assert_eq!(cache.insert(7, &b), Err(AlreadyExists));
        assert_eq!(cache.lookup(&7).unwrap().id, 1);
    }

    #[test]
    fn cleanup_only_removes_the_matching_object() {
        let cache = WeakCache::<u64, Obj>::new(4);
        let (a, b) = (obj(1), obj(2));
        cache.insert(3, &a).unwrap();
        assert!(!cache.cleanup(3, Sref::as_ptr(&b)));
        assert!(cache.lookup(&3).is_some());
        assert!(!cache.cleanup(4, Sref::as_ptr(&a)));
    }

    #[test]
    fn lookups_run_alongside_unlinking() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;
        use std::thread;

        const KEYS: u64 = 4;
        let cache = Arc::new(WeakCache::<u64, Obj>::new(1));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut hits = 0usize;
                    while !done.load(Ordering::Acquire) {
                        for key in 0..KEYS {
                            if let Some(found) = cache.lookup(&key) {
                                assert_eq!(found.id % KEYS, key);
                                hits += 1;
                            }
                        }
                    }
                    hits
                })
            })
            .collect();

        for round in 0..2_000 {
            let key = round % KEYS;
            let o = obj(round);
            cache.insert(key, &o).unwrap();
            cache.cleanup(key, Sref::as_ptr(&o));
        }
        done.store(true, Ordering::Release);
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cache.stats().items, 0);
    }

    #[test]
    fn stats_count_chains() {
        let cache = WeakCache::<u64, Obj>::new(3);
        let objs: Vec<_> = (0..10).map(obj).collect();
        for (i, o) in objs.iter().enumerate() {
            cache.insert(i as u64, o).unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.total_buckets, 4);
        assert_eq!(stats.items, 10);
        assert!(stats.used_buckets >= 1);
        // ten items in four buckets
        assert!(stats.max_chain >= 3);
        assert_eq!(stats.avg_chain(), 2);
        assert!(stats.avg_used_chain().is_some());
        assert!(stats.used_percent() <= 100);
    }
}
