//! # Slab kinds
//!
//! Objects larger than a page that the kernel needs a bounded number of per
//! processor. Each kind gets one [`Kmem`](crate::Kmem) per processor, carved
//! once at boot and never refilled from the page pools; running dry is a
//! normal `None`.

use kernel_info::memory::{
    CPU_KERNEL_STACKS, CPU_WQ_BUFFERS, KERNEL_STACK_SIZE, KSHARED_SIZE, PAGE_SIZE,
    PERF_BUFFER_SIZE, USER_WQ_SIZE, WQ_BUFFER_SIZE,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlabKind {
    /// Kernel stacks.
    Stack,
    /// Performance sample buffers.
    Perf,
    /// Pages shared between the kernel and a process.
    KShared,
    /// Kernel work-queue buffers.
    Wq,
    /// User work-queue buffers.
    UserWq,
}

impl SlabKind {
    pub const COUNT: usize = 5;

    /// Carving order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Stack,
        Self::Perf,
        Self::KShared,
        Self::Wq,
        Self::UserWq,
    ];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Shape of one slab kind's per-processor pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlabSpec {
    pub name: &'static str,
    /// Bytes per object; a non-zero multiple of the page size.
    pub object_size: u64,
    /// Objects carved per processor at boot.
    pub preallocate: usize,
}

impl SlabSpec {
    #[must_use]
    pub const fn new(name: &'static str, object_size: u64, preallocate: usize) -> Self {
        Self {
            name,
            object_size,
            preallocate,
        }
    }

    /// The kernel's sizing for `kind`.
    #[must_use]
    pub const fn kernel_default(kind: SlabKind) -> Self {
        match kind {
            SlabKind::Stack => Self::new("kstack", KERNEL_STACK_SIZE, CPU_KERNEL_STACKS),
            SlabKind::Perf => Self::new("kperf", PERF_BUFFER_SIZE, 1),
            SlabKind::KShared => Self::new("kshared", KSHARED_SIZE, CPU_KERNEL_STACKS),
            SlabKind::Wq => Self::new("wq", WQ_BUFFER_SIZE, CPU_WQ_BUFFERS),
            SlabKind::UserWq => Self::new("uwq", USER_WQ_SIZE, CPU_KERNEL_STACKS),
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.object_size != 0 && self.object_size.is_multiple_of(PAGE_SIZE)
    }
}
