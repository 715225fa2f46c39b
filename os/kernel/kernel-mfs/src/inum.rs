//! # Inode numbers
//!
//! An inode number names the processor that created the node and that
//! processor's sequence number at the time, so processors allocate without
//! talking to each other:
//!
//! ```text
//!  63                              16 15        4 3    0
//! +----------------------------------+-----------+------+
//! |            sequence              |    cpu    | type |
//! +----------------------------------+-----------+------+
//! ```

use bitfield_struct::bitfield;
use core::fmt;
use kernel_sync::CpuId;

/// Node variant, as encoded in the low bits of an [`InodeNumber`].
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MNodeType {
    Dir = 1,
    File = 2,
    Dev = 3,
    Sock = 4,
}

impl MNodeType {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Dir),
            2 => Some(Self::File),
            3 => Some(Self::Dev),
            4 => Some(Self::Sock),
            _ => None,
        }
    }

    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Identity of an mnode.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeNumber {
    /// Raw [`MNodeType`] (bits 0..3).
    #[bits(4)]
    type_bits: u8,
    /// Creating processor (bits 4..15).
    #[bits(12)]
    pub cpu: u16,
    /// Per-processor sequence number (bits 16..63).
    #[bits(48)]
    pub seq: u64,
}

impl InodeNumber {
    pub const SEQ_MASK: u64 = (1 << 48) - 1;

    /// Packs the three fields; the sequence wraps at 48 bits.
    #[must_use]
    pub const fn compose(ty: MNodeType, cpu: CpuId, seq: u64) -> Self {
        Self::new()
            .with_type_bits(ty.into_bits())
            .with_cpu(cpu.as_u16())
            .with_seq(seq & Self::SEQ_MASK)
    }

    /// The node type, `None` for numbers that were never composed.
    #[must_use]
    pub const fn ty(&self) -> Option<MNodeType> {
        MNodeType::from_bits(self.type_bits())
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inum {:#x}", self.into_bits())
    }
}
