//! On-wire patch format: a 28-byte header, one header per element, and five
//! length-prefixed streams per element (equivalences, extra data, raw byte
//! corrections, reference corrections, and informational extra targets).

pub mod reader;
pub mod writer;

use crate::image_utils::ExecutableType;

pub const MAGIC: [u8; 4] = *b"Zuc\0";
pub const HEADER_SIZE: usize = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /// A whole-image byte diff with no disassembler involved (`NoOp`).
    Raw = 0,
    /// One element, recognized as a single executable format, diffed with
    /// that format's disassembler.
    Single = 1,
    /// Multiple elements, each independently detected and matched.
    Ensemble = 2,
}

impl PatchKind {
    pub fn from_u32(value: u32) -> anyhow::Result<Self> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Single),
            2 => Ok(Self::Ensemble),
            other => Err(anyhow::anyhow!("unknown patch kind {other}")),
        }
    }

    /// `raw` and `single` patches carry exactly one element; only `ensemble`
    /// patches may carry more.
    pub fn requires_single_element(self) -> bool {
        matches!(self, Self::Raw | Self::Single)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PatchHeader {
    pub old_size: u32,
    pub old_crc: u32,
    pub new_size: u32,
    pub new_crc: u32,
    pub patch_kind: PatchKind,
    pub element_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ElementHeader {
    pub old_offset: u32,
    pub new_offset: u32,
    pub old_length: u64,
    pub new_length: u64,
    pub exe_type: ExecutableType,
}

/// One equivalence record as it appears on the wire: the extra-data gap
/// preceding it, its length, and the source-offset jump relative to the end
/// of the previous equivalence (zero for the first).
#[derive(Clone, Copy, Debug)]
pub struct EquivalenceRecord {
    pub extra_data_gap: u32,
    pub length: u32,
    pub src_delta: i32,
}

/// A single-byte correction at `copy_offset` (an index into the
/// concatenation of all copied, i.e. equivalence-covered, new-image bytes):
/// the old byte there plus `diff`, wrapping mod 256, yields the new byte.
#[derive(Clone, Copy, Debug)]
pub struct RawDeltaRecord {
    pub copy_offset: u32,
    pub diff: u8,
}

/// A reference re-target at `copy_offset`: the old reference of `type_tag`
/// found at the corresponding old offset had its target shifted by
/// `target_delta` to produce the new reference.
#[derive(Clone, Copy, Debug)]
pub struct ReferenceDeltaRecord {
    pub copy_offset: u32,
    pub type_tag: u8,
    pub target_delta: i32,
}

/// Targets present in the new image's pool that no reference-delta record
/// touches (they only ever appear inside literal extra-data bytes).
/// Informational: apply does not need it to reconstruct the image, but it
/// lets an inspector account for every target in the new pool.
#[derive(Clone, Debug, Default)]
pub struct ExtraTargetBlock {
    pub pool_tag: u8,
    pub targets: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct ElementPatch {
    pub header: ElementHeader,
    pub equivalences: Vec<EquivalenceRecord>,
    pub extra_data: Vec<u8>,
    pub raw_delta: Vec<RawDeltaRecord>,
    pub reference_delta: Vec<ReferenceDeltaRecord>,
    pub extra_targets: Vec<ExtraTargetBlock>,
}

impl Default for ElementHeader {
    fn default() -> Self {
        Self { old_offset: 0, new_offset: 0, old_length: 0, new_length: 0, exe_type: ExecutableType::Unknown }
    }
}

#[derive(Clone, Debug)]
pub struct Patch {
    pub header: PatchHeader,
    pub elements: Vec<ElementPatch>,
}
