#![allow(dead_code)]

use kernel_alloc::{
    BootMemoryMap, DirectMap, Kalloc, KallocConfig, PageInfo, PhysicalAddress, SlabKind,
    SlabSpec,
};
use kernel_info::boot::BootMemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_mfs::{BackingStore, InodeNumber, NodeImage, StoreError};
use kernel_sync::Sref;
use kernel_sync::cpu::{CpuId, install_cpu_source};
use std::alloc::{Layout, alloc_zeroed};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    static CPU: Cell<u16> = const { Cell::new(0) };
}

fn thread_cpu() -> CpuId {
    CpuId::new(CPU.with(Cell::get))
}

pub fn on_cpu(id: u16) {
    install_cpu_source(thread_cpu);
    CPU.with(|c| c.set(id));
}

/// A page allocator over a fresh 2 MiB arena, two processors.
pub fn kalloc() -> &'static Kalloc {
    let pages = 512;
    let len = pages * PAGE_SIZE as usize;
    let layout = Layout::from_size_align(len, PAGE_SIZE as usize).unwrap();
    let base = unsafe { alloc_zeroed(layout) } as u64;
    assert_ne!(base, 0);

    let page = SlabSpec::new("slab", PAGE_SIZE, 1);
    let mut config = KallocConfig::kernel_default(2, PhysicalAddress::new(base));
    for kind in SlabKind::ALL {
        config = config.with_slab(kind, page);
    }
    let map = BootMemoryMap::from_regions(&[BootMemoryRegion::usable(base, len as u64)]).unwrap();
    unsafe { Kalloc::init(map, DirectMap::identity(), &config.with_junk_fill(true)) }.unwrap()
}

/// A backing store serving node images from a table and pages from an
/// allocator.
#[derive(Default)]
pub struct TestStore {
    nodes: Mutex<HashMap<InodeNumber, NodeImage>>,
    pages: Option<&'static Kalloc>,
    failing_page: Option<u64>,
    page_loads: AtomicUsize,
}

impl TestStore {
    pub fn with_pages(kalloc: &'static Kalloc) -> Self {
        Self {
            pages: Some(kalloc),
            ..Self::default()
        }
    }

    pub fn failing_at(mut self, index: u64) -> Self {
        self.failing_page = Some(index);
        self
    }

    pub fn add(&self, inum: InodeNumber, image: NodeImage) {
        self.nodes.lock().unwrap().insert(inum, image);
    }

    pub fn forget(&self, inum: InodeNumber) {
        self.nodes.lock().unwrap().remove(&inum);
    }

    pub fn page_loads(&self) -> usize {
        self.page_loads.load(Ordering::SeqCst)
    }
}

impl BackingStore for TestStore {
    fn load_node(&self, inum: InodeNumber) -> Result<NodeImage, StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .get(&inum)
            .copied()
            .ok_or(StoreError::NotFound(inum))
    }

    fn load_page(
        &self,
        inum: InodeNumber,
        index: u64,
    ) -> Result<Option<Sref<PageInfo>>, StoreError> {
        self.page_loads.fetch_add(1, Ordering::SeqCst);
        if self.failing_page == Some(index) {
            return Err(StoreError::Io { inum, index });
        }
        Ok(self.pages.and_then(|k| k.alloc_page_ref(Some("store"))))
    }
}
