//! # Loader Memory Map Hand-Off

/// Kind of a physical memory region as reported by the loader.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Conventional RAM the kernel may hand out.
    Usable = 1,
    /// Firmware, MMIO, ACPI tables or anything else the kernel must not touch.
    Reserved = 2,
}

/// One physical memory range from the loader's memory map.
///
/// The kernel receives a slice of these right after the loader exits. Regions
/// are not required to be sorted or page-aligned; `kernel-alloc` normalizes
/// them when building its boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootMemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Whether the kernel may use the range.
    pub kind: RegionKind,
}

impl BootMemoryRegion {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Usable,
        }
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Reserved,
        }
    }

    /// Exclusive end address, saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }
}
