//! # Page and slab allocator
//!
//! [`Kalloc`] owns one page pool and one pool per [`SlabKind`] for every
//! processor. Allocation prefers the caller's own pool and then steals from
//! the others in round-robin order; a free always lands on the *freeing*
//! processor's pool, so imbalance corrects itself through stealing.
//!
//! ```text
//!              cpu0        cpu1        cpu2
//!  kmem     [ Kmem ]    [ Kmem ]    [ Kmem ]     ◀─ alloc: me, me+1, me+2 …
//!  kstack   [ Kmem ]    [ Kmem ]    [ Kmem ]
//!  kperf    [ Kmem ]    [ Kmem ]    [ Kmem ]     ◀─ free: current_cpu()
//!  …
//! ```
//!
//! All pools are filled exactly once by [`Kalloc::init`], which carves the
//! boot memory map into page metadata, slab objects and pages.

use crate::addr::{PhysicalAddress, page_round_down};
use crate::boot_mem::BootMemoryMap;
use crate::config::KallocConfig;
use crate::error::KallocError;
use crate::free_list::{FrameCodec, Kmem};
use crate::page_info::{PageInfo, PageInfoTable};
use crate::phys_mapper::DirectMap;
use crate::slab::SlabKind;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::{ALLOC_JUNK, FREE_JUNK, JUNK_FILL_LIMIT, PAGE_SIZE};
use kernel_sync::{CpuId, SyncOnceCell, current_cpu};
use log::{debug, info, warn};

const PAGE_POOL: &str = "kmem";

/// The physical page and slab allocator.
pub struct Kalloc {
    map: BootMemoryMap,
    direct: DirectMap,
    pages: Box<[Kmem]>,
    slabs: [Box<[Kmem]>; SlabKind::COUNT],
    page_info: SyncOnceCell<PageInfoTable>,
    junk_fill: bool,
    initialized: AtomicBool,
}

impl Kalloc {
    /// Carves `map` into per-processor pools.
    ///
    /// 1. The [`PageInfo`] table goes first, sized so it covers every page
    ///    that follows it.
    /// 2. Every processor gets `bytes_from(start) / ncpu` bytes (page
    ///    rounded): first exactly `preallocate` objects of each slab kind,
    ///    then pages until its share is used up.
    ///
    /// The allocator lives for the rest of the kernel's life.
    ///
    /// # Safety
    /// Every usable range of `map` at or above `config.reserved_end` must be
    /// unused memory reachable through `direct`, and no other allocator may
    /// manage it.
    ///
    /// # Errors
    /// See [`KallocError`]. A failure leaks whatever was built so far.
    pub unsafe fn init(
        map: BootMemoryMap,
        direct: DirectMap,
        config: &KallocConfig,
    ) -> Result<&'static Self, KallocError> {
        config.validate()?;
        let frames = FrameCodec::new(&map, direct)?;
        let start = map
            .seek(config.reserved_end.page_round_up())
            .ok_or(KallocError::NoUsableMemory(config.reserved_end))?;

        let cpus = || (0..config.ncpu).map(|c| CpuId::new(u16::try_from(c).unwrap_or(u16::MAX)));
        let pages = cpus()
            .map(|cpu| Kmem::new(PAGE_POOL, cpu, PAGE_SIZE, 0, frames))
            .collect();
        let slabs = core::array::from_fn(|k| {
            let spec = config.slabs[k];
            cpus()
                .map(|cpu| Kmem::new(spec.name, cpu, spec.object_size, spec.preallocate, frames))
                .collect()
        });

        let kalloc: &'static Self = Box::leak(Box::new(Self {
            map,
            direct,
            pages,
            slabs,
            page_info: SyncOnceCell::new(),
            junk_fill: config.junk_fill,
            initialized: AtomicBool::new(false),
        }));

        let carve_start = unsafe { kalloc.place_page_info(start)? };
        kalloc.carve(carve_start)?;

        kalloc.initialized.store(true, Ordering::Release);
        Ok(kalloc)
    }

    /// Builds the page metadata table at the first range that can hold it
    /// and returns the first page after it.
    unsafe fn place_page_info(
        &'static self,
        start: PhysicalAddress,
    ) -> Result<PhysicalAddress, KallocError> {
        let entry = size_of::<PageInfo>() as u64;
        let len = 1 + (self.map.max_end() - start) / (entry + PAGE_SIZE);
        let bytes = len * entry;

        let mut at = start;
        while self.map.size_at(at).is_none_or(|size| size < bytes) {
            at = self
                .map
                .next(at, bytes)
                .ok_or(KallocError::NoRoomForPageInfo { bytes })?;
        }
        let len = usize::try_from(len).map_err(|_| KallocError::NoRoomForPageInfo { bytes })?;
        let base = (at + bytes).page_round_up();

        // SAFETY: `[at, at + bytes)` is usable memory nobody else owns.
        let table = unsafe { PageInfoTable::build(self.direct.p2v(at).cast(), len, base, self) };
        if self.page_info.set(table).is_err() {
            unreachable!("page metadata placed twice");
        }
        debug!("kalloc: {len} page_info entries at {at}, covering pages from {base}");
        Ok(base)
    }

    fn carve(&self, start: PhysicalAddress) -> Result<(), KallocError> {
        let ncpu = self.pages.len() as u64;
        let per_cpu = page_round_down(self.map.bytes_from(start) / ncpu);
        debug!(
            "kalloc: {} MiB usable, {} KiB per processor",
            self.map.total_bytes() >> 20,
            per_cpu >> 10
        );

        let mut cursor = Some(start);
        for (c, page_pool) in self.pages.iter().enumerate() {
            let mut given = 0;
            for kind in SlabKind::ALL {
                let pool = &self.slabs[kind.index()][c];
                for _ in 0..pool.preallocate() {
                    let block = self.fit(cursor, pool)?;
                    unsafe { self.release(pool, block) };
                    cursor = self.map.next(block, pool.object_size());
                    given += pool.object_size();
                }
            }

            while given < per_cpu {
                let Some(page) = cursor else {
                    warn!(
                        "kalloc: boot memory exhausted filling {} page pool",
                        page_pool.cpu()
                    );
                    break;
                };
                unsafe { self.release(page_pool, page) };
                cursor = self.map.next(page, PAGE_SIZE);
                given += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// First address at or after `cursor` with room for one of `pool`'s
    /// objects.
    fn fit(
        &self,
        cursor: Option<PhysicalAddress>,
        pool: &Kmem,
    ) -> Result<PhysicalAddress, KallocError> {
        let exhausted = KallocError::SlabExhausted {
            name: pool.name(),
            cpu: pool.cpu(),
        };
        let mut at = cursor.ok_or(exhausted)?;
        while self
            .map
            .size_at(at)
            .is_none_or(|size| size < pool.object_size())
        {
            at = self.map.next(at, pool.object_size()).ok_or(exhausted)?;
        }
        Ok(at)
    }

    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub const fn map(&self) -> &BootMemoryMap {
        &self.map
    }

    #[inline]
    #[must_use]
    pub const fn direct(&self) -> DirectMap {
        self.direct
    }

    #[inline]
    #[must_use]
    pub fn ncpu(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn page_pool(&self, cpu: CpuId) -> Option<&Kmem> {
        self.pages.get(cpu.as_usize())
    }

    #[must_use]
    pub fn slab_pool(&self, kind: SlabKind, cpu: CpuId) -> Option<&Kmem> {
        self.slabs[kind.index()].get(cpu.as_usize())
    }

    pub(crate) fn page_info_table(&self) -> Option<&PageInfoTable> {
        self.page_info.get()
    }

    /// Allocates one page; `name` labels the allocation in traces.
    #[must_use]
    pub fn alloc(&self, name: Option<&str>) -> Option<NonNull<u8>> {
        self.alloc_from(&self.pages, name)
    }

    /// Returns a page to the calling processor's pool.
    ///
    /// # Safety
    /// `page` must have come from this allocator's page side and must not be
    /// used afterwards.
    ///
    /// # Panics
    /// If `page` is not page aligned or not inside usable memory.
    pub unsafe fn free(&self, page: NonNull<u8>) {
        unsafe { self.release(Self::local(&self.pages), self.direct.v2p(page.as_ptr())) }
    }

    /// Allocates one object of `kind`.
    #[must_use]
    pub fn slab_alloc(&self, kind: SlabKind) -> Option<NonNull<u8>> {
        self.alloc_from(&self.slabs[kind.index()], None)
    }

    /// Returns an object to the calling processor's `kind` pool.
    ///
    /// # Safety
    /// As for [`free`](Self::free), for an object obtained from
    /// [`slab_alloc`](Self::slab_alloc) with the same `kind`.
    ///
    /// # Panics
    /// If `object` is not page aligned or not inside usable memory.
    pub unsafe fn slab_free(&self, kind: SlabKind, object: NonNull<u8>) {
        let pool = Self::local(&self.slabs[kind.index()]);
        unsafe { self.release(pool, self.direct.v2p(object.as_ptr())) }
    }

    /// The caller's pool. Processors beyond the configured count share
    /// pools modulo the count.
    fn local(pools: &[Kmem]) -> &Kmem {
        &pools[current_cpu().as_usize() % pools.len()]
    }

    fn alloc_from(&self, pools: &[Kmem], name: Option<&str>) -> Option<NonNull<u8>> {
        let n = pools.len();
        let me = current_cpu().as_usize() % n;
        for i in 0..n {
            let pool = &pools[(me + i) % n];
            if let Some(block) = pool.pop(name) {
                if self.junk_fill && pool.object_size() <= JUNK_FILL_LIMIT {
                    // SAFETY: the block is ours and `object_size` bytes long.
                    unsafe { fill(block, ALLOC_JUNK, pool.object_size()) };
                }
                return Some(block);
            }
        }
        warn!("kalloc: out of memory in pool {}", pools[0].name());
        None
    }

    unsafe fn release(&self, pool: &Kmem, pa: PhysicalAddress) {
        let block = self.direct.p2v(pa);
        assert!(pa.is_page_aligned(), "kfree: misaligned {block:p}");
        assert!(
            self.map.containing(pa).is_some(),
            "kfree: unknown region {block:p}"
        );
        let Some(block) = NonNull::new(block) else {
            unreachable!("direct map yields null for usable memory")
        };

        if self.junk_fill && self.is_initialized() && pool.object_size() <= JUNK_FILL_LIMIT {
            unsafe { fill(block, FREE_JUNK, pool.object_size()) };
        }
        unsafe { pool.push(block) };
    }

    /// Free counts of every pool.
    #[must_use]
    pub fn stats(&self) -> KallocStats {
        let pool = |pools: &[Kmem]| PoolStats {
            name: pools[0].name(),
            object_size: pools[0].object_size(),
            free: pools.iter().map(Kmem::free_count).collect(),
        };
        KallocStats {
            pages: pool(&self.pages),
            slabs: core::array::from_fn(|k| pool(&self.slabs[k])),
        }
    }

    /// Logs one line per pool; the caller's own count is bracketed.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let me = current_cpu();
        for pool in core::iter::once(&stats.pages).chain(&stats.slabs) {
            info!("pool {}: [ {}]", pool.name, FreeCounts { pool, me });
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
unsafe fn fill(block: NonNull<u8>, byte: u8, len: u64) {
    unsafe { block.as_ptr().write_bytes(byte, len as usize) }
}

/// Per-processor free counts of one pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub name: &'static str,
    pub object_size: u64,
    pub free: Vec<usize>,
}

impl PoolStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.free.iter().sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KallocStats {
    pub pages: PoolStats,
    pub slabs: [PoolStats; SlabKind::COUNT],
}

impl KallocStats {
    #[must_use]
    pub fn slab(&self, kind: SlabKind) -> &PoolStats {
        &self.slabs[kind.index()]
    }
}

struct FreeCounts<'a> {
    pool: &'a PoolStats,
    me: CpuId,
}

impl fmt::Display for FreeCounts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (cpu, free) in self.pool.free.iter().enumerate() {
            if cpu == self.me.as_usize() {
                write!(f, "<{free}> ")?;
            } else {
                write!(f, "{free} ")?;
            }
        }
        Ok(())
    }
}
