#![allow(dead_code)]

use kernel_alloc::{
    BootMemoryMap, DirectMap, Kalloc, KallocConfig, PhysicalAddress, SlabKind, SlabSpec,
};
use kernel_info::boot::BootMemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::cpu::{CpuId, install_cpu_source};
use std::alloc::{Layout, alloc_zeroed};
use std::cell::Cell;

thread_local! {
    static CPU: Cell<u16> = const { Cell::new(0) };
}

fn thread_cpu() -> CpuId {
    CpuId::new(CPU.with(Cell::get))
}

/// Pretends the calling thread runs on processor `id`.
pub fn on_cpu(id: u16) {
    install_cpu_source(thread_cpu);
    CPU.with(|c| c.set(id));
}

/// A leaked, zeroed, page-aligned buffer standing in for physical memory.
pub fn arena(pages: usize) -> u64 {
    let len = pages * PAGE_SIZE as usize;
    let layout = Layout::from_size_align(len, PAGE_SIZE as usize).unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null());
    base as u64
}

/// Small slabs so a 1 MiB arena holds everything: 10 pages per processor.
pub fn small_config(ncpu: usize, reserved_end: u64) -> KallocConfig {
    KallocConfig::kernel_default(ncpu, PhysicalAddress::new(reserved_end))
        .with_slab(SlabKind::Stack, SlabSpec::new("kstack", 2 * PAGE_SIZE, 2))
        .with_slab(SlabKind::Perf, SlabSpec::new("kperf", PAGE_SIZE, 1))
        .with_slab(SlabKind::KShared, SlabSpec::new("kshared", PAGE_SIZE, 2))
        .with_slab(SlabKind::Wq, SlabSpec::new("wq", 2 * PAGE_SIZE, 1))
        .with_slab(SlabKind::UserWq, SlabSpec::new("uwq", PAGE_SIZE, 1))
        .with_junk_fill(false)
}

pub fn boot_with(regions: &[BootMemoryRegion], config: &KallocConfig) -> &'static Kalloc {
    let map = BootMemoryMap::from_regions(regions).unwrap();
    unsafe { Kalloc::init(map, DirectMap::identity(), config) }.unwrap()
}

/// A 256-page arena split across `ncpu` processors.
pub fn boot(ncpu: usize) -> &'static Kalloc {
    boot_configured(ncpu, |c| c)
}

pub fn boot_configured(
    ncpu: usize,
    tweak: impl FnOnce(KallocConfig) -> KallocConfig,
) -> &'static Kalloc {
    let base = arena(256);
    let config = tweak(small_config(ncpu, base));
    boot_with(
        &[BootMemoryRegion::usable(base, 256 * PAGE_SIZE)],
        &config,
    )
}
