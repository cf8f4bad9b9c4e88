//! Serializes a [`Patch`] into its on-wire byte representation.

use crate::varint;

use super::{ElementPatch, Patch};

/// A plain growable byte buffer with the small set of encodings the patch
/// format needs: fixed-width little-endian integers and LEB128 varints.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_varint_u32(&mut self, value: u32) {
        varint::encode_u32(value, &mut self.buf);
    }

    pub fn push_varint_i32(&mut self, value: i32) {
        varint::encode_i32(value, &mut self.buf);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes `bytes` preceded by its length as a `u64`, as every framed
    /// stream in the patch format is.
    pub fn push_block(&mut self, bytes: &[u8]) {
        self.push_u64(bytes.len() as u64);
        self.push_bytes(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Encodes the equivalence stream's three sub-buffers: signed-varint
/// src-skip deltas, unsigned-varint dst-skip deltas, and unsigned-varint
/// lengths. The record count is never written explicitly; a reader decodes
/// each sub-buffer until its declared byte length is exhausted.
fn encode_equivalences(element: &ElementPatch) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut src_skips = Vec::new();
    let mut dst_skips = Vec::new();
    let mut lengths = Vec::new();
    for record in &element.equivalences {
        varint::encode_i32(record.src_delta, &mut src_skips);
        varint::encode_u32(record.extra_data_gap, &mut dst_skips);
        varint::encode_u32(record.length, &mut lengths);
    }
    (src_skips, dst_skips, lengths)
}

/// Encodes the raw-delta stream's two sub-buffers: unsigned-varint
/// copy-offset skips (delta-encoded against the previous position with a
/// bias of 1, so adjacent positions store `0`), and one diff byte per
/// record.
fn encode_raw_delta(element: &ElementPatch) -> (Vec<u8>, Vec<u8>) {
    let mut offsets = Vec::new();
    let mut diffs = Vec::new();
    let mut prev: i64 = -1;
    for record in &element.raw_delta {
        let skip = record.copy_offset as i64 - prev - 1;
        varint::encode_u32(skip as u32, &mut offsets);
        diffs.push(record.diff);
        prev = record.copy_offset as i64;
    }
    (offsets, diffs)
}

fn encode_reference_delta(element: &ElementPatch) -> Vec<u8> {
    let mut w = Writer::new();
    for record in &element.reference_delta {
        w.push_varint_u32(record.copy_offset);
        w.push_u8(record.type_tag);
        w.push_varint_i32(record.target_delta);
    }
    w.into_bytes()
}

fn encode_extra_target_pool(targets: &[u32]) -> Vec<u8> {
    let mut w = Writer::new();
    let mut prev = 0u32;
    for &target in targets {
        w.push_varint_u32(target - prev);
        prev = target;
    }
    w.into_bytes()
}

/// Writes `patch` to its on-wire byte representation.
pub fn write_patch(patch: &Patch) -> Vec<u8> {
    let mut w = Writer::new();
    w.push_bytes(&super::MAGIC);
    w.push_u32(patch.header.old_size);
    w.push_u32(patch.header.old_crc);
    w.push_u32(patch.header.new_size);
    w.push_u32(patch.header.new_crc);
    w.push_u32(patch.header.patch_kind as u32);
    w.push_u32(patch.header.element_count);

    for element in &patch.elements {
        w.push_u32(element.header.old_offset);
        w.push_u32(element.header.new_offset);
        w.push_u64(element.header.old_length);
        w.push_u64(element.header.new_length);
        w.push_u32(element.header.exe_type.into());

        let (src_skips, dst_skips, lengths) = encode_equivalences(element);
        w.push_block(&src_skips);
        w.push_block(&dst_skips);
        w.push_block(&lengths);

        w.push_block(&element.extra_data);

        let (raw_offsets, raw_diffs) = encode_raw_delta(element);
        w.push_block(&raw_offsets);
        w.push_block(&raw_diffs);

        w.push_block(&encode_reference_delta(element));

        w.push_u32(element.extra_targets.len() as u32);
        for block in &element.extra_targets {
            w.push_u8(block.pool_tag);
            w.push_block(&encode_extra_target_pool(&block.targets));
        }
    }

    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_utils::ExecutableType;
    use crate::patch::reader::read_patch;
    use crate::patch::{ElementHeader, ExtraTargetBlock, PatchHeader, PatchKind, RawDeltaRecord, ReferenceDeltaRecord};

    #[test]
    fn roundtrips_a_fully_populated_element() {
        let element = ElementPatch {
            header: ElementHeader { old_offset: 4, new_offset: 0, old_length: 10, new_length: 12, exe_type: ExecutableType::Win32X86 },
            equivalences: vec![
                super::super::EquivalenceRecord { extra_data_gap: 2, length: 5, src_delta: 0 },
                super::super::EquivalenceRecord { extra_data_gap: 0, length: 3, src_delta: -1 },
            ],
            extra_data: vec![0xAA, 0xBB],
            raw_delta: vec![RawDeltaRecord { copy_offset: 1, diff: 0x7F }, RawDeltaRecord { copy_offset: 2, diff: 0x01 }],
            reference_delta: vec![ReferenceDeltaRecord { copy_offset: 3, type_tag: 1, target_delta: -12 }],
            extra_targets: vec![ExtraTargetBlock { pool_tag: 1, targets: vec![0x10, 0x20, 0x30] }],
        };
        let patch = Patch {
            header: PatchHeader { old_size: 100, old_crc: 0x1234, new_size: 110, new_crc: 0x5678, patch_kind: PatchKind::Single, element_count: 1 },
            elements: vec![element],
        };

        let bytes = write_patch(&patch);
        let decoded = read_patch(&bytes).unwrap();

        assert_eq!(decoded.header.old_size, 100);
        assert_eq!(decoded.header.new_crc, 0x5678);
        assert_eq!(decoded.header.patch_kind, PatchKind::Single);
        assert_eq!(decoded.elements.len(), 1);
        let e = &decoded.elements[0];
        assert_eq!(e.header.old_length, 10);
        assert_eq!(e.header.new_length, 12);
        assert_eq!(e.equivalences.len(), 2);
        assert_eq!(e.equivalences[1].src_delta, -1);
        assert_eq!(e.extra_data, vec![0xAA, 0xBB]);
        assert_eq!(e.raw_delta[0].diff, 0x7F);
        assert_eq!(e.raw_delta[1].copy_offset, 2);
        assert_eq!(e.reference_delta[0].target_delta, -12);
        assert_eq!(e.extra_targets[0].targets, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn header_fields_are_emitted_in_spec_order() {
        let patch = Patch {
            header: PatchHeader { old_size: 1, old_crc: 2, new_size: 3, new_crc: 4, patch_kind: PatchKind::Raw, element_count: 0 },
            elements: vec![],
        };
        let bytes = write_patch(&patch);
        assert_eq!(&bytes[0..4], &super::super::MAGIC);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1); // old_size
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 2); // old_crc
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3); // new_size
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 4); // new_crc
    }
}
