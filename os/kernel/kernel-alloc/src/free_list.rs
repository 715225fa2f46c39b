//! # Lock-free per-processor free lists
//!
//! A [`Kmem`] is a Treiber stack of free, equally sized blocks. The link
//! lives inside the free block itself (a [`Run`] header), so an empty pool
//! costs nothing but its head word.
//!
//! ## ABA
//!
//! Every processor pushes and pops on every pool (local frees, remote
//! steals), without locks. A plain pointer CAS would let this interleaving
//! corrupt the list:
//!
//! ```text
//!  cpu0: head = A, reads A.next = B          (stalls)
//!  cpu1: pop A, pop B, push A                head = A, A.next = C
//!  cpu0: CAS(head: A -> B) succeeds          B is handed out twice
//! ```
//!
//! The head is therefore a [`TaggedHead`]: a 32-bit frame index plus a
//! 32-bit tag that changes on every successful CAS, packed in one `u64`.
//! cpu0's CAS above fails because the tag moved on. Frame indices are
//! relative to the lowest usable page ([`FrameCodec`]); index `0` is the
//! empty list.
//!
//! ## Tag width
//!
//! The tag wraps modulo 2^32. A stale CAS can only succeed if the popper is
//! held up between loading the head and its exchange while the same pool
//! performs a multiple of 2^32 successful exchanges and ends with the same
//! frame on top. At one exchange per 10 ns that is over 40 seconds inside a
//! handful of instructions; pops and pushes run with the caller on its
//! processor and do not block, so the bound is never approached. Frame
//! indices keep their full 32 bits (16 TiB of 4 KiB pages) instead of
//! trading span for tag bits.

use crate::addr::PhysicalAddress;
use crate::boot_mem::BootMemoryMap;
use crate::error::KallocError;
use crate::phys_mapper::DirectMap;
use bitfield_struct::bitfield;
use core::hint::spin_loop;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};
use kernel_sync::CpuId;
use log::trace;

/// Head word of a [`Kmem`].
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct TaggedHead {
    /// Frame index of the top run, `0` when empty.
    pub frame: u32,
    /// Bumped on every successful exchange.
    pub tag: u32,
}

/// Header written into a block while it sits on a free list.
#[repr(C)]
pub struct Run {
    /// Frame index of the next run, `0` at the tail.
    next: AtomicU32,
}

/// Converts between direct-map pointers and 32-bit frame indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameCodec {
    origin: PhysicalAddress,
    direct: DirectMap,
    pages: u32,
}

impl FrameCodec {
    /// Largest encodable page span; index `0` is reserved for "empty".
    pub const MAX_PAGES: u64 = u32::MAX as u64 - 1;

    /// Covers every page between the lowest and the highest usable address.
    ///
    /// # Errors
    /// [`KallocError::TooLarge`] if the span does not fit a 32-bit index.
    pub fn new(map: &BootMemoryMap, direct: DirectMap) -> Result<Self, KallocError> {
        let origin = map
            .first_base()
            .ok_or(KallocError::NoUsableMemory(PhysicalAddress::zero()))?;
        let pages = map.span_pages();
        let pages = u32::try_from(pages)
            .ok()
            .filter(|&p| u64::from(p) <= Self::MAX_PAGES)
            .ok_or(KallocError::TooLarge {
                pages,
                max: Self::MAX_PAGES,
            })?;
        Ok(Self {
            origin,
            direct,
            pages,
        })
    }

    #[must_use]
    pub const fn direct(&self) -> DirectMap {
        self.direct
    }

    /// # Panics
    /// If `block` does not lie on a page inside the covered span.
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&self, block: NonNull<u8>) -> u32 {
        let pa = self.direct.v2p(block.as_ptr());
        assert!(
            pa >= self.origin && pa.is_page_aligned(),
            "free list: block {block:p} outside the managed span"
        );
        let idx = (pa - self.origin) >> PAGE_SHIFT;
        assert!(idx < u64::from(self.pages), "free list: block {block:p} past the managed span");
        idx as u32 + 1
    }

    fn decode(&self, frame: u32) -> Option<NonNull<u8>> {
        let idx = u64::from(frame.checked_sub(1)?);
        self.direct.p2v_nonnull(self.origin + idx * PAGE_SIZE)
    }
}

/// One processor's pool of equally sized blocks.
#[repr(C, align(64))]
pub struct Kmem {
    head: AtomicU64,
    nfree: AtomicUsize,
    frames: FrameCodec,
    name: &'static str,
    cpu: CpuId,
    size: u64,
    preallocate: usize,
}

impl Kmem {
    #[must_use]
    pub const fn new(
        name: &'static str,
        cpu: CpuId,
        size: u64,
        preallocate: usize,
        frames: FrameCodec,
    ) -> Self {
        Self {
            head: AtomicU64::new(0),
            nfree: AtomicUsize::new(0),
            frames,
            name,
            cpu,
            size,
            preallocate,
        }
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Size of every block in this pool.
    #[inline]
    #[must_use]
    pub const fn object_size(&self) -> u64 {
        self.size
    }

    /// Blocks carved into this pool at boot.
    #[inline]
    #[must_use]
    pub const fn preallocate(&self) -> usize {
        self.preallocate
    }

    /// Number of blocks on the list; exact whenever no push or pop is in
    /// flight.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.nfree.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn head(&self) -> TaggedHead {
        TaggedHead::from_bits(self.head.load(Ordering::Acquire))
    }

    /// Takes the top block, or `None` when the pool is empty.
    ///
    /// `label` only shows up in traces.
    pub fn pop(&self, label: Option<&str>) -> Option<NonNull<u8>> {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let head = TaggedHead::from_bits(cur);
            let run = self.frames.decode(head.frame())?;

            // The block may be popped and overwritten by its new owner
            // between these two loads; the tag check below discards the stale
            // link in that case.
            let next = unsafe { run.cast::<Run>().as_ref() }
                .next
                .load(Ordering::Relaxed);
            let new = head.with_frame(next).with_tag(head.tag().wrapping_add(1));

            match self.head.compare_exchange_weak(
                cur,
                new.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.nfree.fetch_sub(1, Ordering::Relaxed);
                    trace!(
                        "{}/{}: alloc {run:p} {}",
                        self.cpu,
                        self.name,
                        label.unwrap_or(self.name)
                    );
                    return Some(run);
                }
                Err(seen) => {
                    cur = seen;
                    spin_loop();
                }
            }
        }
    }

    /// Puts `block` on top of the list.
    ///
    /// # Safety
    /// `block` must be an unused block of this pool's size that no other list
    /// holds, and must stay untouched until popped again.
    pub unsafe fn push(&self, block: NonNull<u8>) {
        let frame = self.frames.encode(block);
        // SAFETY: the caller hands us exclusive ownership of the block.
        let run = unsafe { block.cast::<Run>().as_ref() };

        // Counted before the exchange so a racing pop never takes the count
        // below zero.
        self.nfree.fetch_add(1, Ordering::Relaxed);

        let mut cur = self.head.load(Ordering::Relaxed);
        loop {
            let head = TaggedHead::from_bits(cur);
            run.next.store(head.frame(), Ordering::Relaxed);
            let new = head.with_frame(frame).with_tag(head.tag().wrapping_add(1));
            match self.head.compare_exchange_weak(
                cur,
                new.into_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => {
                    cur = seen;
                    spin_loop();
                }
            }
        }
        trace!("{}/{}: free {block:p}", self.cpu, self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::BootMemoryRegion;
    use std::alloc::{Layout, alloc_zeroed};

    fn arena(pages: usize) -> (BootMemoryMap, FrameCodec, NonNull<u8>) {
        let len = pages * PAGE_SIZE as usize;
        let layout = Layout::from_size_align(len, PAGE_SIZE as usize).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
        let map = BootMemoryMap::from_regions(&[BootMemoryRegion::usable(
            base.as_ptr() as u64,
            len as u64,
        )])
        .unwrap();
        let codec = FrameCodec::new(&map, DirectMap::identity()).unwrap();
        (map, codec, base)
    }

    fn page(base: NonNull<u8>, i: usize) -> NonNull<u8> {
        unsafe { base.add(i * PAGE_SIZE as usize) }
    }

    #[test]
    fn lifo_order_and_count() {
        let (_map, codec, base) = arena(4);
        let pool = Kmem::new("test", CpuId::BOOT, PAGE_SIZE, 0, codec);
        assert!(pool.pop(None).is_none());

        for i in 0..3 {
            unsafe { pool.push(page(base, i)) };
        }
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.pop(None), Some(page(base, 2)));
        assert_eq!(pool.pop(Some("label")), Some(page(base, 1)));
        assert_eq!(pool.pop(None), Some(page(base, 0)));
        assert!(pool.pop(None).is_none());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn every_exchange_moves_the_tag() {
        let (_map, codec, base) = arena(1);
        let pool = Kmem::new("test", CpuId::BOOT, PAGE_SIZE, 0, codec);
        let before = pool.head();

        unsafe { pool.push(page(base, 0)) };
        let run = pool.pop(None).unwrap();

        // Same (empty) frame, different tag.
        let after = pool.head();
        assert_eq!(after.frame(), before.frame());
        assert_eq!(after.tag(), before.tag().wrapping_add(2));
        assert_ne!(after, before);
        assert_eq!(run, page(base, 0));
    }

    #[test]
    fn stale_head_cannot_be_installed() {
        let (_map, codec, base) = arena(3);
        let pool = Kmem::new("test", CpuId::BOOT, PAGE_SIZE, 0, codec);
        for i in 0..3 {
            unsafe { pool.push(page(base, i)) };
        }
        let observed = pool.head.load(Ordering::Acquire);

        // pop A, pop B, push A: the frame on top is A again
        let a = pool.pop(None).unwrap();
        let _b = pool.pop(None).unwrap();
        unsafe { pool.push(a) };
        assert_eq!(pool.head().frame(), TaggedHead::from_bits(observed).frame());

        let stale = TaggedHead::from_bits(observed).with_frame(1);
        let swapped = pool.head.compare_exchange(
            observed,
            stale.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(swapped.is_err());
    }

    #[test]
    fn tag_wraps_without_losing_the_list() {
        let (_map, codec, base) = arena(2);
        let pool = Kmem::new("test", CpuId::BOOT, PAGE_SIZE, 0, codec);
        let worn = TaggedHead::new().with_tag(u32::MAX);
        pool.head.store(worn.into_bits(), Ordering::Relaxed);

        unsafe { pool.push(page(base, 0)) };
        assert_eq!(pool.head().tag(), 0);
        unsafe { pool.push(page(base, 1)) };
        assert_eq!(pool.head().tag(), 1);

        assert_eq!(pool.pop(None), Some(page(base, 1)));
        assert_eq!(pool.pop(None), Some(page(base, 0)));
        assert!(pool.pop(None).is_none());
        assert_eq!(pool.head().tag(), 3);
    }

    #[test]
    fn codec_round_trip() {
        let (_map, codec, base) = arena(8);
        let frame = codec.encode(page(base, 5));
        assert_eq!(frame, 6);
        assert_eq!(codec.decode(frame), Some(page(base, 5)));
        assert_eq!(codec.decode(0), None);
    }

    #[test]
    #[should_panic(expected = "outside the managed span")]
    fn codec_rejects_misaligned_blocks() {
        let (_map, codec, base) = arena(2);
        let _ = codec.encode(unsafe { base.add(8) });
    }
}
