use crate::addr::PhysicalAddress;
use crate::error::KallocError;
use crate::slab::{SlabKind, SlabSpec};
use kernel_info::memory::{JUNK_FILL_DEFAULT, MAX_CPUS};

/// Boot-time parameters of [`Kalloc::init`](crate::Kalloc::init).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KallocConfig {
    /// Processors to build pools for.
    pub ncpu: usize,
    /// First physical address not occupied by the kernel image or the boot
    /// allocator; nothing below it is carved.
    pub reserved_end: PhysicalAddress,
    /// Per-kind slab shapes, indexed by [`SlabKind::index`].
    pub slabs: [SlabSpec; SlabKind::COUNT],
    /// Overwrite freed and freshly allocated blocks with junk bytes.
    pub junk_fill: bool,
}

impl KallocConfig {
    /// The kernel's slab sizing and the build's junk-fill default.
    #[must_use]
    pub const fn kernel_default(ncpu: usize, reserved_end: PhysicalAddress) -> Self {
        Self {
            ncpu,
            reserved_end,
            slabs: [
                SlabSpec::kernel_default(SlabKind::Stack),
                SlabSpec::kernel_default(SlabKind::Perf),
                SlabSpec::kernel_default(SlabKind::KShared),
                SlabSpec::kernel_default(SlabKind::Wq),
                SlabSpec::kernel_default(SlabKind::UserWq),
            ],
            junk_fill: JUNK_FILL_DEFAULT,
        }
    }

    #[must_use]
    pub const fn with_slab(mut self, kind: SlabKind, spec: SlabSpec) -> Self {
        self.slabs[kind.index()] = spec;
        self
    }

    #[must_use]
    pub const fn with_junk_fill(mut self, junk_fill: bool) -> Self {
        self.junk_fill = junk_fill;
        self
    }

    #[must_use]
    pub const fn slab(&self, kind: SlabKind) -> &SlabSpec {
        &self.slabs[kind.index()]
    }

    /// # Errors
    /// [`KallocError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), KallocError> {
        if self.ncpu == 0 || self.ncpu > MAX_CPUS {
            return Err(KallocError::InvalidConfig("ncpu must be in 1..=MAX_CPUS"));
        }
        if !self.slabs.iter().all(SlabSpec::is_valid) {
            return Err(KallocError::InvalidConfig(
                "slab object sizes must be non-zero page multiples",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = KallocConfig::kernel_default(4, PhysicalAddress::new(0x40_0000));
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.slab(SlabKind::Wq).name, "wq");
    }

    #[test]
    fn rejects_bad_processor_counts_and_sizes() {
        let cfg = KallocConfig::kernel_default(0, PhysicalAddress::zero());
        assert!(matches!(cfg.validate(), Err(KallocError::InvalidConfig(_))));

        let cfg = KallocConfig::kernel_default(MAX_CPUS + 1, PhysicalAddress::zero());
        assert!(cfg.validate().is_err());

        let cfg = KallocConfig::kernel_default(1, PhysicalAddress::zero())
            .with_slab(SlabKind::Perf, SlabSpec::new("kperf", 100, 1));
        assert!(cfg.validate().is_err());
    }
}
