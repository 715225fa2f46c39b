use crate::addr::PhysicalAddress;
use kernel_sync::CpuId;
use thiserror::Error;

/// Failures while building the boot memory map or carving the pools.
///
/// Runtime exhaustion is not an error; [`Kalloc::alloc`](crate::Kalloc::alloc)
/// and friends report it as `None`.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum KallocError {
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("usable regions at {first} and {second} overlap")]
    OverlappingRegions {
        first: PhysicalAddress,
        second: PhysicalAddress,
    },
    #[error("no usable memory at or above {0}")]
    NoUsableMemory(PhysicalAddress),
    #[error("no usable range can hold {bytes} bytes of page metadata")]
    NoRoomForPageInfo { bytes: u64 },
    #[error("boot memory exhausted while carving {name} objects for {cpu}")]
    SlabExhausted { name: &'static str, cpu: CpuId },
    #[error("usable memory spans {pages} pages, free-list links address at most {max}")]
    TooLarge { pages: u64, max: u64 },
}
