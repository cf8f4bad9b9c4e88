//! x86 / x64 reference types: abs32 (stored absolute RVA) and rel32 (PC
//! relative displacement after a recognized branch/call opcode).

use anyhow::{ensure, Result};

use crate::address_translator::AddressTranslator;
use crate::buffer::{ImageView, ImageViewMut};
use crate::image_utils::{Offset, Reference, ReferenceTraits};

use super::ReferenceType;

pub const POOL_ABS32: u8 = 0;
pub const POOL_REL32: u8 = 1;

pub const TYPE_ABS32: u8 = 0;
pub const TYPE_REL32: u8 = 1;

/// A 4-byte absolute RVA reference, as found in PE/ELF relocation targets.
pub struct Abs32;

impl ReferenceType for Abs32 {
    fn traits(&self) -> ReferenceTraits {
        ReferenceTraits { type_tag: TYPE_ABS32, pool_tag: POOL_ABS32, width: 4 }
    }

    fn read(&self, image: ImageView<'_>, location: Offset, translator: &AddressTranslator) -> Option<Reference> {
        let rva = image.read_u32(location as usize).ok()?;
        let target = translator.rva_to_offset(rva)?;
        Some(Reference { location, target })
    }

    fn write(&self, image: &mut ImageViewMut<'_>, reference: Reference, translator: &AddressTranslator) -> Result<()> {
        let rva = translator.offset_to_rva(reference.target).ok_or_else(|| anyhow::anyhow!("abs32 target has no RVA"))?;
        image.write_u32(reference.location as usize, rva)?;
        Ok(())
    }
}

/// A 4-byte PC-relative displacement following `E8` (call rel32), `E9` (jmp
/// rel32), or `0F 8x` (jcc rel32). The opcode byte(s) precede `location`,
/// which points at the displacement itself.
pub struct Rel32 {
    pub opcode_width: usize,
}

impl ReferenceType for Rel32 {
    fn traits(&self) -> ReferenceTraits {
        ReferenceTraits { type_tag: TYPE_REL32, pool_tag: POOL_REL32, width: 4 }
    }

    fn read(&self, image: ImageView<'_>, location: Offset, translator: &AddressTranslator) -> Option<Reference> {
        let disp = image.read_i32(location as usize).ok()?;
        let instr_rva = translator.offset_to_rva(location)?;
        let rip_after = instr_rva.checked_add(4)?;
        let target_rva = (rip_after as i64 + disp as i64) as u32;
        let target = translator.rva_to_offset(target_rva)?;
        Some(Reference { location, target })
    }

    fn write(&self, image: &mut ImageViewMut<'_>, reference: Reference, translator: &AddressTranslator) -> Result<()> {
        let instr_rva = translator
            .offset_to_rva(reference.location)
            .ok_or_else(|| anyhow::anyhow!("rel32 location has no RVA"))?;
        let target_rva = translator
            .offset_to_rva(reference.target)
            .ok_or_else(|| anyhow::anyhow!("rel32 target has no RVA"))?;
        let rip_after = instr_rva as i64 + 4;
        let disp = target_rva as i64 - rip_after;
        ensure!(disp >= i32::MIN as i64 && disp <= i32::MAX as i64, "rel32 displacement overflows");
        image.write_u32(reference.location as usize, disp as i32 as u32)?;
        Ok(())
    }
}

/// Scans `window` (a byte range of `image` known not to overlap any abs32
/// reference) for opcodes encoding a PC-relative rel32 operand. Returns
/// candidate *locations* of the displacement field, not yet validated
/// against the translator (the caller does that and skips matched ranges so
/// the sweep never overlaps an accepted reference).
pub fn find_rel32_candidates(image: ImageView<'_>, window: (usize, usize)) -> Vec<Offset> {
    let (start, end) = window;
    let data = image.as_slice();
    let mut candidates = Vec::new();
    let mut i = start;
    while i < end {
        let rest = end.saturating_sub(i);
        if rest >= 5 && data[i] == 0xE8 {
            candidates.push((i + 1) as Offset);
            i += 5;
        } else if rest >= 5 && data[i] == 0xE9 {
            candidates.push((i + 1) as Offset);
            i += 5;
        } else if rest >= 6 && data[i] == 0x0F && (0x80..=0x8F).contains(&data[i + 1]) {
            candidates.push((i + 2) as Offset);
            i += 6;
        } else {
            i += 1;
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_translator::identity_translator;
    use crate::buffer::{ImageView, ImageViewMut};

    #[test]
    fn abs32_roundtrips() {
        let translator = identity_translator(0x100).unwrap();
        let mut data = [0u8; 8];
        let mut sink = ImageViewMut::new(&mut data);
        Abs32.write(&mut sink, Reference { location: 0, target: 0x40 }, &translator).unwrap();
        let view = ImageView::new(&data);
        let r = Abs32.read(view, 0, &translator).unwrap();
        assert_eq!(r.target, 0x40);
    }

    #[test]
    fn rel32_roundtrips_forward_and_backward() {
        let translator = identity_translator(0x100).unwrap();
        let mut data = [0u8; 8];
        let mut sink = ImageViewMut::new(&mut data);
        // location 0, rip_after = 4, target 0x20 is forward.
        Rel32 { opcode_width: 1 }.write(&mut sink, Reference { location: 0, target: 0x20 }, &translator).unwrap();
        let r = Rel32 { opcode_width: 1 }.read(ImageView::new(&data), 0, &translator).unwrap();
        assert_eq!(r.target, 0x20);

        let mut data2 = [0u8; 8];
        let mut sink2 = ImageViewMut::new(&mut data2);
        // target before the instruction: backward branch.
        Rel32 { opcode_width: 1 }.write(&mut sink2, Reference { location: 4, target: 0 }, &translator).unwrap();
        let r2 = Rel32 { opcode_width: 1 }.read(ImageView::new(&data2), 4, &translator).unwrap();
        assert_eq!(r2.target, 0);
    }

    #[test]
    fn rel32_rejects_out_of_range_displacement() {
        let translator = identity_translator(0x100).unwrap();
        let mut data = [0u8; 8];
        let mut sink = ImageViewMut::new(&mut data);
        // No valid RVA for a target far outside the image under the identity
        // translator, so the write itself must fail.
        let result = Rel32 { opcode_width: 1 }.write(&mut sink, Reference { location: 0, target: 0xFFFF }, &translator);
        assert!(result.is_err());
    }

    #[test]
    fn finds_call_and_jmp_and_jcc_candidates() {
        let mut data = vec![0u8; 20];
        data[0] = 0xE8; // call rel32
        data[6] = 0xE9; // jmp rel32
        data[11] = 0x0F;
        data[12] = 0x84; // je rel32
        let view = ImageView::new(&data);
        let candidates = find_rel32_candidates(view, (0, data.len()));
        assert_eq!(candidates, vec![1, 7, 13]);
    }
}
