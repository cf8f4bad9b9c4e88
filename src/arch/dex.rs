//! DEX bytecode references: signed branch displacements (in 16-bit code
//! units) and table-index operands (string/type/method/field ids). DEX has
//! no separate virtual-address space, so the identity address translator
//! (offset == rva) is always used with these types.

use anyhow::{ensure, Result};

use crate::address_translator::AddressTranslator;
use crate::buffer::{ImageView, ImageViewMut};
use crate::image_utils::{Offset, Reference, ReferenceTraits};

use super::ReferenceType;

pub const POOL_DEX_STRING: u8 = 5;
pub const POOL_DEX_TYPE: u8 = 6;
pub const POOL_DEX_METHOD: u8 = 7;
pub const POOL_DEX_FIELD: u8 = 8;
pub const POOL_DEX_CODE: u8 = 9;

pub const TYPE_DEX_STRING_ID16: u8 = 5;
pub const TYPE_DEX_TYPE_ID16: u8 = 6;
pub const TYPE_DEX_METHOD_ID16: u8 = 7;
pub const TYPE_DEX_FIELD_ID16: u8 = 8;
pub const TYPE_DEX_REL16: u8 = 9;
pub const TYPE_DEX_REL32: u8 = 10;

/// A 16-bit index into one of DEX's fixed-width id tables (string_ids,
/// type_ids, method_ids, field_ids). The target is the file offset of the
/// indexed table entry, not the data it ultimately names.
pub struct DexIndex16 {
    pub type_tag: u8,
    pub pool_tag: u8,
    pub table_offset: Offset,
    pub table_count: u32,
    pub entry_width: u32,
}

impl ReferenceType for DexIndex16 {
    fn traits(&self) -> ReferenceTraits {
        ReferenceTraits { type_tag: self.type_tag, pool_tag: self.pool_tag, width: 2 }
    }

    fn read(&self, image: ImageView<'_>, location: Offset, _translator: &AddressTranslator) -> Option<Reference> {
        let index = u32::from(image.read_u16(location as usize).ok()?);
        if index >= self.table_count {
            return None;
        }
        let target = self.table_offset + index * self.entry_width;
        Some(Reference { location, target })
    }

    fn write(&self, image: &mut ImageViewMut<'_>, reference: Reference, _translator: &AddressTranslator) -> Result<()> {
        ensure!(reference.target >= self.table_offset, "DEX index target precedes table");
        let index = (reference.target - self.table_offset) / self.entry_width;
        ensure!(index < self.table_count, "DEX index overflows table");
        ensure!(index <= u16::MAX as u32, "DEX index overflows 16 bits");
        image.write_u16(reference.location as usize, index as u16)?;
        Ok(())
    }
}

/// `goto/16`: a signed 16-bit branch displacement, in code units, relative
/// to the opcode's own code unit (two bytes before `location`).
pub struct DexRel16;

impl Default for DexRel16 {
    fn default() -> Self {
        DexRel16
    }
}

impl ReferenceType for DexRel16 {
    fn traits(&self) -> ReferenceTraits {
        ReferenceTraits { type_tag: TYPE_DEX_REL16, pool_tag: POOL_DEX_CODE, width: 2 }
    }

    fn read(&self, image: ImageView<'_>, location: Offset, _translator: &AddressTranslator) -> Option<Reference> {
        let disp = image.read_u16(location as usize).ok()? as i16;
        let instr_offset = location.checked_sub(2)?;
        let target = (instr_offset as i64 + i64::from(disp) * 2) as u32;
        Some(Reference { location, target })
    }

    fn write(&self, image: &mut ImageViewMut<'_>, reference: Reference, _translator: &AddressTranslator) -> Result<()> {
        let instr_offset = reference.location.checked_sub(2).ok_or_else(|| anyhow::anyhow!("rel16 underflows"))?;
        let disp = (reference.target as i64 - instr_offset as i64) / 2;
        ensure!(disp >= i16::MIN as i64 && disp <= i16::MAX as i64, "rel16 displacement overflows");
        image.write_u16(reference.location as usize, disp as i16 as u16)?;
        Ok(())
    }
}

/// `goto/32`: a signed 32-bit branch displacement, in code units, stored as
/// two ordinary little-endian 16-bit halves (no swap, unlike THUMB2).
pub struct DexRel32;

impl Default for DexRel32 {
    fn default() -> Self {
        DexRel32
    }
}

impl ReferenceType for DexRel32 {
    fn traits(&self) -> ReferenceTraits {
        ReferenceTraits { type_tag: TYPE_DEX_REL32, pool_tag: POOL_DEX_CODE, width: 4 }
    }

    fn read(&self, image: ImageView<'_>, location: Offset, _translator: &AddressTranslator) -> Option<Reference> {
        let disp = image.read_i32(location as usize).ok()?;
        let instr_offset = location.checked_sub(2)?;
        let target = (instr_offset as i64 + i64::from(disp) * 2) as u32;
        Some(Reference { location, target })
    }

    fn write(&self, image: &mut ImageViewMut<'_>, reference: Reference, _translator: &AddressTranslator) -> Result<()> {
        let instr_offset = reference.location.checked_sub(2).ok_or_else(|| anyhow::anyhow!("rel32 underflows"))?;
        let disp = (reference.target as i64 - instr_offset as i64) / 2;
        ensure!(disp >= i32::MIN as i64 && disp <= i32::MAX as i64, "rel32 displacement overflows");
        image.write_u32(reference.location as usize, disp as i32 as u32)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_translator::identity_translator;
    use crate::buffer::{ImageView, ImageViewMut};

    #[test]
    fn index16_roundtrips_into_table_entry() {
        let translator = identity_translator(0x1000).unwrap();
        let string_ids = DexIndex16 { type_tag: TYPE_DEX_STRING_ID16, pool_tag: POOL_DEX_STRING, table_offset: 0x100, table_count: 8, entry_width: 4 };
        let mut data = [0u8; 2];
        let mut sink = ImageViewMut::new(&mut data);
        string_ids.write(&mut sink, Reference { location: 0, target: 0x100 + 3 * 4 }, &translator).unwrap();
        let r = string_ids.read(ImageView::new(&data), 0, &translator).unwrap();
        assert_eq!(r.target, 0x100 + 3 * 4);
    }

    #[test]
    fn index16_rejects_index_past_table_count() {
        let translator = identity_translator(0x1000).unwrap();
        let type_ids = DexIndex16 { type_tag: TYPE_DEX_TYPE_ID16, pool_tag: POOL_DEX_TYPE, table_offset: 0x100, table_count: 4, entry_width: 4 };
        let mut data = [0u8; 2];
        let mut sink = ImageViewMut::new(&mut data);
        let result = type_ids.write(&mut sink, Reference { location: 0, target: 0x100 + 10 * 4 }, &translator);
        assert!(result.is_err());
    }

    #[test]
    fn rel16_roundtrips_forward_branch() {
        let translator = identity_translator(0x1000).unwrap();
        let mut data = [0u8; 4];
        let mut sink = ImageViewMut::new(&mut data);
        // location 2 (the operand), instruction opcode unit at offset 0.
        DexRel16.write(&mut sink, Reference { location: 2, target: 10 }, &translator).unwrap();
        let r = DexRel16.read(ImageView::new(&data), 2, &translator).unwrap();
        assert_eq!(r.target, 10);
    }

    #[test]
    fn rel32_roundtrips_using_code_unit_scaling() {
        let translator = identity_translator(0x10000).unwrap();
        let mut data = [0u8; 6];
        let mut sink = ImageViewMut::new(&mut data);
        DexRel32.write(&mut sink, Reference { location: 2, target: 0x200 }, &translator).unwrap();
        let r = DexRel32.read(ImageView::new(&data), 2, &translator).unwrap();
        assert_eq!(r.target, 0x200);
    }
}
