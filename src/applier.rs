//! Reconstructs the new image from an old image and a [`Patch`]: the exact
//! inverse of [`crate::generator::generate`]'s per-element encoding.

use anyhow::{ensure, Context, Result};

use crate::address_translator::identity_translator;
use crate::buffer::{ImageView, ImageViewMut};
use crate::crc32::crc32;
use crate::disassembler::DisassemblerTypes;
use crate::image_utils::Reference;
use crate::patch::reader::read_patch;
use crate::patch::ElementPatch;

/// Applies `patch_bytes` to `old`, returning the reconstructed new image.
/// Fails if `old`'s CRC does not match the patch's recorded old CRC, or if
/// the result's CRC does not match the recorded new CRC.
pub fn apply(old: &[u8], patch_bytes: &[u8]) -> Result<Vec<u8>> {
    let patch = read_patch(patch_bytes)?;
    ensure!(old.len() == patch.header.old_size as usize, "old image size does not match patch header");
    ensure!(crc32(old) == patch.header.old_crc, "old image CRC does not match patch header");

    let mut new_buf = vec![0u8; patch.header.new_size as usize];
    for element in &patch.elements {
        apply_element(old, &mut new_buf, element)?;
    }

    ensure!(crc32(&new_buf) == patch.header.new_crc, "reconstructed image CRC does not match patch header");
    Ok(new_buf)
}

/// One contiguous copied region, recorded while replaying equivalence
/// records, so later streams can map their `copy_offset` (a position in the
/// concatenation of all copied bytes) back to actual src/dst offsets.
struct CopyRegion {
    copy_start: u32,
    src_start: u32,
    dst_start: u32,
    length: u32,
}

fn locate(regions: &[CopyRegion], copy_offset: u32) -> Option<(u32, u32)> {
    let idx = regions.partition_point(|r| r.copy_start <= copy_offset);
    if idx == 0 {
        return None;
    }
    let region = &regions[idx - 1];
    let delta = copy_offset - region.copy_start;
    if delta >= region.length {
        return None;
    }
    Some((region.src_start + delta, region.dst_start + delta))
}

fn apply_element(old: &[u8], new_buf: &mut [u8], element: &ElementPatch) -> Result<()> {
    let old_start = element.header.old_offset as usize;
    let old_slice = &old[old_start..old_start + element.header.old_length as usize];
    let new_start = element.header.new_offset as usize;
    let new_range = new_start..new_start + element.header.new_length as usize;
    let new_slice = &mut new_buf[new_range];

    let mut regions = Vec::with_capacity(element.equivalences.len());
    let mut dst_cursor = 0u32;
    let mut src_cursor = 0i64;
    let mut extra_cursor = 0usize;
    let mut copy_cursor = 0u32;

    for record in &element.equivalences {
        let gap = record.extra_data_gap as usize;
        let gap_bytes = element
            .extra_data
            .get(extra_cursor..extra_cursor + gap)
            .context("extra-data stream shorter than declared gap")?;
        new_slice[dst_cursor as usize..dst_cursor as usize + gap].copy_from_slice(gap_bytes);
        extra_cursor += gap;
        dst_cursor += gap as u32;

        let src_offset = (src_cursor + record.src_delta as i64) as u32;
        ensure!((src_offset + record.length) as usize <= old_slice.len(), "equivalence reads past old element");
        new_slice[dst_cursor as usize..(dst_cursor + record.length) as usize]
            .copy_from_slice(&old_slice[src_offset as usize..(src_offset + record.length) as usize]);

        regions.push(CopyRegion { copy_start: copy_cursor, src_start: src_offset, dst_start: dst_cursor, length: record.length });

        copy_cursor += record.length;
        dst_cursor += record.length;
        src_cursor = (src_offset + record.length) as i64;
    }

    let trailing = element.extra_data.get(extra_cursor..).context("extra-data stream shorter than trailing gap")?;
    new_slice[dst_cursor as usize..].copy_from_slice(trailing);

    for record in &element.raw_delta {
        let (_, dst_offset) = locate(&regions, record.copy_offset).context("raw-delta offset outside any equivalence")?;
        let slot = &mut new_slice[dst_offset as usize];
        *slot = slot.wrapping_add(record.diff);
    }

    if !element.reference_delta.is_empty() {
        apply_reference_deltas(new_slice, &regions, element)?;
    }

    Ok(())
}

fn apply_reference_deltas(new_slice: &mut [u8], regions: &[CopyRegion], element: &ElementPatch) -> Result<()> {
    // The equivalence/raw-delta copy above has already populated every byte
    // of new_slice, including its header, so a DEX element's id tables are
    // readable from new_slice itself at this point.
    let types = DisassemblerTypes::for_image(element.header.exe_type, ImageView::new(new_slice));
    let translator = identity_translator(new_slice.len())?;

    for record in &element.reference_delta {
        let (_, dst_offset) =
            locate(regions, record.copy_offset).context("reference-delta offset outside any equivalence")?;
        let reference_type =
            types.by_type_tag(record.type_tag).with_context(|| format!("unknown reference type tag {}", record.type_tag))?;

        let old_target = {
            let view = ImageView::new(new_slice);
            reference_type.read(view, dst_offset, &translator).context("reference-delta site does not decode")?.target
        };
        let new_target = (old_target as i64 + record.target_delta as i64) as u32;

        let mut view_mut = ImageViewMut::new(new_slice);
        reference_type.write(&mut view_mut, Reference { location: dst_offset, target: new_target }, &translator)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::generate;

    #[test]
    fn roundtrips_identity_patch() {
        let data = b"hello world, this is a test payload".to_vec();
        let patch = generate(&data, &data, None).unwrap();
        let result = apply(&data, &patch).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn roundtrips_single_byte_change() {
        let old = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut new = old.clone();
        new[10] = b'X';
        let patch = generate(&old, &new, None).unwrap();
        let result = apply(&old, &patch).unwrap();
        assert_eq!(result, new);
    }

    #[test]
    fn roundtrips_pure_insertion() {
        let old = b"abcdefghijklmnopqrstuvwxyz".to_vec();
        let mut new = old[..13].to_vec();
        new.extend_from_slice(b"INSERTED-TEXT");
        new.extend_from_slice(&old[13..]);
        let patch = generate(&old, &new, None).unwrap();
        let result = apply(&old, &patch).unwrap();
        assert_eq!(result, new);
    }

    /// A minimal PE32 image `detect_elements` recognizes as `Win32X86`: an
    /// MZ/PE/machine header real enough to probe, filled with `0xFF` so
    /// every other 4-byte-aligned word decodes as an out-of-range (so
    /// invalid) abs32 candidate, except the one we place deliberately.
    fn build_pe32_image(abs32_target: u32) -> Vec<u8> {
        let mut data = vec![0xFFu8; 96];
        data[0] = b'M';
        data[1] = b'Z';
        data[0x3C..0x40].copy_from_slice(&64u32.to_le_bytes()); // e_lfanew
        data[64..68].copy_from_slice(b"PE\0\0");
        data[68] = 0x4C;
        data[69] = 0x01; // IMAGE_FILE_MACHINE_I386
        data[72..76].copy_from_slice(&abs32_target.to_le_bytes());
        data
    }

    #[test]
    fn roundtrips_win32x86_abs32_target_shift() {
        let old = build_pe32_image(40);
        let new = build_pe32_image(8);

        let patch = generate(&old, &new, None).unwrap();
        let decoded = crate::patch::reader::read_patch(&patch).unwrap();
        assert_eq!(decoded.header.patch_kind, crate::patch::PatchKind::Single);

        let result = apply(&old, &patch).unwrap();
        assert_eq!(result, new);
    }

    #[test]
    fn rejects_wrong_old_image() {
        let old = b"original payload bytes here".to_vec();
        let new = b"original payload bytes changed".to_vec();
        let patch = generate(&old, &new, None).unwrap();
        let mut wrong_old = old.clone();
        wrong_old[0] = b'!';
        assert!(apply(&wrong_old, &patch).is_err());
    }
}
