//! # Memory Configuration

/// Size of a physical page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel image is placed in *physical* memory.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Usable regions below this address are ignored by the allocator.
pub const LOW_MEMORY_END: u64 = PHYS_LOAD;

/// Upper bound on the number of processors; sizes per-CPU arrays.
pub const MAX_CPUS: usize = 64;

/// The size of a kernel stack (slab object).
pub const KERNEL_STACK_SIZE: u64 = 32 * 1024;

/// Kernel stacks carved per processor at boot.
pub const CPU_KERNEL_STACKS: usize = 8;

/// Size of the per-processor performance sample buffer.
pub const PERF_BUFFER_SIZE: u64 = 1024 * 1024;

/// Size of a kernel/user shared page block.
pub const KSHARED_SIZE: u64 = 16 * 1024;

/// Size of a kernel work-queue buffer, page rounded.
pub const WQ_BUFFER_SIZE: u64 = 8 * 1024;

/// Work-queue buffers carved per processor at boot.
pub const CPU_WQ_BUFFERS: usize = 2;

/// Size of a user work-queue buffer.
pub const USER_WQ_SIZE: u64 = 8 * 1024;

/// Byte written over memory when it is freed (post-init only).
pub const FREE_JUNK: u8 = 0x01;

/// Byte written over memory when it is handed out.
pub const ALLOC_JUNK: u8 = 0x02;

/// Objects larger than this are not junk-filled.
pub const JUNK_FILL_LIMIT: u64 = 16 * 1024;

/// Whether junk filling is enabled unless configured otherwise.
pub const JUNK_FILL_DEFAULT: bool = cfg!(debug_assertions);

/// Number of buckets in the mnode cache.
pub const MNODE_CACHE_BUCKETS: usize = 1 << 16;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(PERF_BUFFER_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KSHARED_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(WQ_BUFFER_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(USER_WQ_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(MAX_CPUS <= 4096);
    assert!(MNODE_CACHE_BUCKETS.is_power_of_two());
};
