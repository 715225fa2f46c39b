//! # Processor identity
//!
//! Every per-processor structure of the memory subsystem (page pools, slab
//! pools, inode sequence counters, quiescence slots) is indexed by the id of
//! the processor running the caller. The kernel installs a source that reads
//! its per-CPU block; hosted tests install one backed by a thread-local.

use crate::SyncOnceCell;
use core::fmt;

pub use kernel_info::memory::MAX_CPUS;

/// Logical processor index (`0..MAX_CPUS`).
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u16);

impl CpuId {
    /// The bootstrap processor.
    pub const BOOT: Self = Self(0);

    /// # Panics
    /// If `id` is not below [`MAX_CPUS`].
    #[must_use]
    pub const fn new(id: u16) -> Self {
        assert!((id as usize) < MAX_CPUS, "processor id out of range");
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

static CPU_SOURCE: SyncOnceCell<fn() -> CpuId> = SyncOnceCell::new();

/// Installs the function answering "which processor am I on".
///
/// Returns `false` if a source was already installed; the first one wins.
pub fn install_cpu_source(source: fn() -> CpuId) -> bool {
    CPU_SOURCE.set(source).is_ok()
}

/// The processor executing the caller, or [`CpuId::BOOT`] before a source is
/// installed.
#[inline]
#[must_use]
pub fn current_cpu() -> CpuId {
    CPU_SOURCE.get().map_or(CpuId::BOOT, |source| source())
}
