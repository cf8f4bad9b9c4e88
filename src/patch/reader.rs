//! Parses the on-wire byte representation back into a [`Patch`].

use anyhow::{ensure, Context, Result};

use crate::image_utils::ExecutableType;
use crate::varint;

use super::{
    ElementHeader, ElementPatch, EquivalenceRecord, ExtraTargetBlock, Patch, PatchHeader, PatchKind,
    RawDeltaRecord, ReferenceDeltaRecord, HEADER_SIZE, MAGIC,
};

/// A cursor over a byte slice, matching [`super::writer::Writer`]'s
/// encodings.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).context("unexpected end of patch")?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        ensure!(self.remaining() >= 4, "unexpected end of patch reading u32");
        let bytes = [self.data[self.pos], self.data[self.pos + 1], self.data[self.pos + 2], self.data[self.pos + 3]];
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        ensure!(self.remaining() >= 8, "unexpected end of patch reading u64");
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let (value, used) = varint::decode_u32(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_varint_i32(&mut self) -> Result<i32> {
        let (value, used) = varint::decode_i32(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(self.remaining() >= len, "unexpected end of patch reading {len} bytes");
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads one length-prefixed block (`u64` byte length) and returns a
    /// sub-reader over it.
    pub fn read_block(&mut self) -> Result<Reader<'a>> {
        let len = self.read_u64()?;
        let len = usize::try_from(len).map_err(|_| anyhow::anyhow!("block length overflows usize"))?;
        Ok(Reader::new(self.read_bytes(len)?))
    }
}

/// Decodes the equivalence stream's three sub-buffers, each read until its
/// own bytes are exhausted, zipping the three resulting sequences back into
/// records.
fn read_equivalences(src_skips: &mut Reader<'_>, dst_skips: &mut Reader<'_>, lengths: &mut Reader<'_>) -> Result<Vec<EquivalenceRecord>> {
    let mut out = Vec::new();
    while !src_skips.is_empty() {
        let src_delta = src_skips.read_varint_i32()?;
        let extra_data_gap = dst_skips.read_varint_u32().context("dst-skip sub-buffer shorter than src-skip")?;
        let length = lengths.read_varint_u32().context("length sub-buffer shorter than src-skip")?;
        out.push(EquivalenceRecord { extra_data_gap, length, src_delta });
    }
    ensure!(dst_skips.is_empty() && lengths.is_empty(), "equivalence sub-buffers disagree on record count");
    Ok(out)
}

/// Decodes the raw-delta stream's two sub-buffers: copy-offset skips
/// (delta-encoded against the previous position with a bias of 1) and one
/// diff byte per record.
fn read_raw_delta(offsets: &mut Reader<'_>, diffs: &mut Reader<'_>) -> Result<Vec<RawDeltaRecord>> {
    let mut out = Vec::new();
    let mut prev: i64 = -1;
    while !offsets.is_empty() {
        let skip = offsets.read_varint_u32()?;
        let copy_offset = (prev + 1 + skip as i64) as u32;
        let diff = diffs.read_u8().context("diff sub-buffer shorter than offset sub-buffer")?;
        out.push(RawDeltaRecord { copy_offset, diff });
        prev = copy_offset as i64;
    }
    ensure!(diffs.is_empty(), "raw-delta sub-buffers disagree on record count");
    Ok(out)
}

fn read_reference_delta(r: &mut Reader<'_>) -> Result<Vec<ReferenceDeltaRecord>> {
    let mut out = Vec::new();
    while !r.is_empty() {
        let copy_offset = r.read_varint_u32()?;
        let type_tag = r.read_u8()?;
        let target_delta = r.read_varint_i32()?;
        out.push(ReferenceDeltaRecord { copy_offset, type_tag, target_delta });
    }
    Ok(out)
}

fn read_extra_target_pool(r: &mut Reader<'_>) -> Result<Vec<u32>> {
    let mut targets = Vec::new();
    let mut prev = 0u32;
    while !r.is_empty() {
        prev += r.read_varint_u32()?;
        targets.push(prev);
    }
    Ok(targets)
}

/// Parses `data` as a patch, validating the magic, every length prefix, and
/// the structural invariants a well-formed patch must hold.
pub fn read_patch(data: &[u8]) -> Result<Patch> {
    ensure!(data.len() >= HEADER_SIZE, "patch shorter than header");
    let mut r = Reader::new(data);
    let magic = r.read_bytes(4)?;
    ensure!(magic == MAGIC, "bad patch magic");

    let old_size = r.read_u32()?;
    let old_crc = r.read_u32()?;
    let new_size = r.read_u32()?;
    let new_crc = r.read_u32()?;
    let patch_kind = PatchKind::from_u32(r.read_u32()?)?;
    let element_count = r.read_u32()?;

    if patch_kind.requires_single_element() {
        ensure!(element_count == 1, "raw/single patches must carry exactly one element, got {element_count}");
    }

    let mut elements = Vec::with_capacity(element_count as usize);
    for _ in 0..element_count {
        let old_offset = r.read_u32()?;
        let new_offset = r.read_u32()?;
        let old_length = r.read_u64()?;
        let new_length = r.read_u64()?;
        let exe_type = ExecutableType::try_from(r.read_u32()?).context("unknown element executable type")?;
        let header = ElementHeader { old_offset, new_offset, old_length, new_length, exe_type };

        let mut src_skips = r.read_block()?;
        let mut dst_skips = r.read_block()?;
        let mut lengths = r.read_block()?;
        let equivalences = read_equivalences(&mut src_skips, &mut dst_skips, &mut lengths)?;

        let extra_data = r.read_block()?.read_bytes_to_end();

        let mut raw_offsets = r.read_block()?;
        let mut raw_diffs = r.read_block()?;
        let raw_delta = read_raw_delta(&mut raw_offsets, &mut raw_diffs)?;

        let reference_delta = read_reference_delta(&mut r.read_block()?)?;

        let pool_count = r.read_u32()?;
        let mut extra_targets = Vec::with_capacity(pool_count as usize);
        for _ in 0..pool_count {
            let pool_tag = r.read_u8()?;
            let targets = read_extra_target_pool(&mut r.read_block()?)?;
            extra_targets.push(ExtraTargetBlock { pool_tag, targets });
        }

        ensure!(
            data_fits_within(old_offset, old_length, old_size),
            "element old range [{old_offset}, {old_offset}+{old_length}) falls outside old image of size {old_size}"
        );
        ensure!(
            data_fits_within(new_offset, new_length, new_size),
            "element new range [{new_offset}, {new_offset}+{new_length}) falls outside new image of size {new_size}"
        );

        elements.push(ElementPatch { header, equivalences, extra_data, raw_delta, reference_delta, extra_targets });
    }

    let mut expected_new_offset: u64 = 0;
    for element in &elements {
        ensure!(
            element.header.new_offset as u64 == expected_new_offset,
            "elements are not contiguous in new-side order: expected offset {expected_new_offset}, got {}",
            element.header.new_offset
        );
        expected_new_offset += element.header.new_length;
    }
    ensure!(
        expected_new_offset == new_size as u64,
        "elements do not tile the new image: covered {expected_new_offset} of {new_size} bytes"
    );

    Ok(Patch {
        header: PatchHeader { old_size, old_crc, new_size, new_crc, patch_kind, element_count },
        elements,
    })
}

fn data_fits_within(offset: u32, length: u64, image_size: u32) -> bool {
    let Some(end) = (offset as u64).checked_add(length) else { return false };
    end <= image_size as u64
}

impl<'a> Reader<'a> {
    fn read_bytes_to_end(&mut self) -> Vec<u8> {
        let rest = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::writer::write_patch;
    use crate::patch::{ElementHeader, ElementPatch};
    use crate::image_utils::ExecutableType;

    fn single_element_patch(old_size: u32, new_size: u32, new_length: u64) -> Patch {
        Patch {
            header: PatchHeader { old_size, old_crc: 0, new_size, new_crc: 0, patch_kind: PatchKind::Single, element_count: 1 },
            elements: vec![ElementPatch {
                header: ElementHeader { old_offset: 0, new_offset: 0, old_length: old_size as u64, new_length, exe_type: ExecutableType::NoOp },
                ..Default::default()
            }],
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = write_patch(&single_element_patch(4, 4, 4));
        bytes[0] = b'X';
        assert!(read_patch(&bytes).is_err());
    }

    #[test]
    fn rejects_element_count_over_one_for_raw_kind() {
        let mut patch = single_element_patch(4, 4, 4);
        patch.header.patch_kind = PatchKind::Raw;
        patch.header.element_count = 2;
        patch.elements.push(patch.elements[0].clone());
        let bytes = write_patch(&patch);
        assert!(read_patch(&bytes).is_err());
    }

    #[test]
    fn rejects_element_range_past_image_bounds() {
        let mut patch = single_element_patch(4, 4, 4);
        patch.elements[0].header.new_length = 10;
        let bytes = write_patch(&patch);
        assert!(read_patch(&bytes).is_err());
    }

    #[test]
    fn rejects_elements_that_do_not_tile_the_new_image() {
        let mut patch = single_element_patch(4, 8, 4);
        patch.header.patch_kind = PatchKind::Single;
        let bytes = write_patch(&patch);
        assert!(read_patch(&bytes).is_err());
    }

    #[test]
    fn accepts_a_well_formed_patch() {
        let bytes = write_patch(&single_element_patch(4, 4, 4));
        assert!(read_patch(&bytes).is_ok());
    }
}
