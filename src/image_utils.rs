//! Shared primitives: offsets, RVAs, references, and the executable-type
//! enumeration. Internally we keep "real offset" and "pool key" as distinct
//! sum-type variants rather than reusing the source format's MSB-marking
//! trick; the high-bit convention is only meaningful on the wire, and our
//! wire format (see [`crate::patch`]) does not need it either since every
//! stream is explicit about what it stores.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// A 32-bit file offset into an image.
pub type Offset = u32;
/// A 32-bit runtime virtual address.
pub type Rva = u32;
/// A small integer identifying an architecture-specific reference encoding.
pub type TypeTag = u8;
/// A small integer identifying a set of reference types sharing a target
/// namespace.
pub type PoolTag = u8;
/// A shared label index correlating an old target with a new target.
pub type Label = u32;

pub const INVALID_OFFSET: Offset = Offset::MAX;
pub const NO_TYPE_TAG: TypeTag = 0xFF;

/// A (location, target) pair identifying a pointer-like field in the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub location: Offset,
    pub target: Offset,
}

/// A (location, key) pair used once targets have been deduplicated into a
/// pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndirectReference {
    pub location: Offset,
    pub key: u32,
}

/// Fixed per-type metadata: byte width and the pool it shares a namespace
/// with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceTraits {
    pub type_tag: TypeTag,
    pub pool_tag: PoolTag,
    pub width: usize,
}

/// Identifies the executable format interpreted by one disassembler. Value
/// assignments are part of the on-wire format.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum ExecutableType {
    Unknown = 0,
    Win32X86 = 1,
    Win32X64 = 2,
    ElfX86 = 3,
    ElfX64 = 4,
    ElfArm32 = 5,
    ElfAarch64 = 6,
    Dex = 7,
    NoOp = 8,
}

/// Returns whether data at `offset` with `length` fits entirely within
/// `[0, image_size)`, using subtraction to avoid overflow.
pub fn data_fits(offset: Offset, length: usize, image_size: usize) -> bool {
    let offset = offset as usize;
    if length == 0 {
        return offset <= image_size;
    }
    if offset >= image_size {
        return false;
    }
    image_size - offset >= length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_accepts_the_end_of_image_sentinel() {
        assert!(data_fits(10, 0, 10));
        assert!(!data_fits(11, 0, 10));
    }

    #[test]
    fn ranged_reads_must_fit_entirely_inside() {
        assert!(data_fits(6, 4, 10));
        assert!(!data_fits(7, 4, 10));
        assert!(!data_fits(10, 1, 10));
    }
}
