//! Per-architecture reference readers/writers. Each architecture exposes a
//! set of [`ReferenceType`] implementations instead of the source corpus's
//! template-with-function-pointer pattern: dispatch is statically known per
//! call site, one impl per reference type.

pub mod arm;
pub mod dex;
pub mod dex_layout;
pub mod x86;

use crate::address_translator::AddressTranslator;
use crate::buffer::{ImageView, ImageViewMut};
use crate::image_utils::{Offset, Reference, ReferenceTraits};

/// Fetches, decodes, and re-encodes one architecture-specific inline
/// reference. `fetch`/`decode` are read operations; `encode` is a write
/// operation used only during apply.
pub trait ReferenceType {
    fn traits(&self) -> ReferenceTraits;

    /// Attempts to read and decode the reference whose encoded bytes begin
    /// at `location`. Returns `None` on opcode mismatch (not an error: the
    /// caller skips and keeps scanning).
    fn read(&self, image: ImageView<'_>, location: Offset, translator: &AddressTranslator) -> Option<Reference>;

    /// Re-encodes `reference` and writes it at `reference.location`. Fails
    /// if the displacement overflows the field or violates alignment.
    fn write(&self, image: &mut ImageViewMut<'_>, reference: Reference, translator: &AddressTranslator) -> anyhow::Result<()>;
}

/// A group of locations sharing one [`ReferenceType`], discovered by
/// enumerating a window of the image once.
pub struct ReferenceGroup<'a> {
    pub reference_type: &'a dyn ReferenceType,
    pub references: Vec<Reference>,
}

/// Byte windows not overlapping any already-known abs32 reference; used to
/// scope the rel32 sweep so it never mistakes relocation data for code.
pub fn gap_windows(size: usize, abs32_locations: &[(Offset, usize)]) -> Vec<(usize, usize)> {
    let mut covered: Vec<(usize, usize)> = abs32_locations
        .iter()
        .map(|&(loc, width)| (loc as usize, loc as usize + width))
        .collect();
    covered.sort_unstable();
    let mut gaps = Vec::new();
    let mut cursor = 0usize;
    for (start, end) in covered {
        if start > cursor {
            gaps.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if cursor < size {
        gaps.push((cursor, size));
    }
    gaps
}
