//! Builds an [`AddressTranslator`] and the set of [`ReferenceGroup`]s for one
//! element, dispatched by [`ExecutableType`]. `NoOp` (raw byte diffing, no
//! references) shares the same downstream pipeline as every architecture
//! disassembler: only the reference groups it contributes differ. DEX is the
//! one format whose reference types need per-image state (its id-table
//! offsets), built by [`DisassemblerTypes::for_image`].

use anyhow::Result;

use crate::address_translator::{identity_translator, AddressTranslator};
use crate::arch::dex_layout::{DexLayout, DexReferenceTypes};
use crate::arch::{arm, dex, gap_windows, x86, ReferenceGroup, ReferenceType};
use crate::buffer::ImageView;
use crate::image_utils::{ExecutableType, Offset};

/// One element's disassembler: knows how to build an address translator for
/// it and which reference types to scan for.
pub struct Disassembler {
    exe_type: ExecutableType,
}

impl Disassembler {
    pub fn for_type(exe_type: ExecutableType) -> Self {
        Self { exe_type }
    }

    pub fn exe_type(&self) -> ExecutableType {
        self.exe_type
    }

    /// Builds the address translator for this element. Formats without a
    /// real section table (`NoOp`, `Dex`) use the identity mapping: offset
    /// and RVA coincide.
    pub fn build_translator(&self, image: ImageView<'_>) -> Result<AddressTranslator> {
        match self.exe_type {
            ExecutableType::NoOp | ExecutableType::Dex => identity_translator(image.len()),
            // A full PE/ELF section-table walk is out of scope here; treat
            // the image as a single identity-mapped unit, which still lets
            // abs32/rel32 references be found and round-tripped, just
            // without cross-section RVA remapping.
            _ => identity_translator(image.len()),
        }
    }

    /// Scans `image` for references, returning one [`ReferenceGroup`] per
    /// reference type this format defines. `types` must come from
    /// [`DisassemblerTypes::for_image`] built over the same `image` when
    /// `exe_type()` is `Dex`, since its id-table references need that
    /// image's own table directory; every other format's types are
    /// `default()`-equivalent regardless of image.
    pub fn find_references<'a>(
        &self,
        image: ImageView<'a>,
        translator: &AddressTranslator,
        types: &'a DisassemblerTypes,
    ) -> Vec<ReferenceGroup<'a>> {
        match self.exe_type {
            ExecutableType::NoOp => Vec::new(),
            ExecutableType::Win32X86 | ExecutableType::Win32X64 | ExecutableType::ElfX86 | ExecutableType::ElfX64 => {
                find_x86_references(image, translator, types)
            }
            ExecutableType::ElfArm32 => find_arm_references(image, translator, types),
            ExecutableType::ElfAarch64 => find_aarch64_references(image, translator, types),
            ExecutableType::Dex => find_dex_references(image, translator, types),
            ExecutableType::Unknown => Vec::new(),
        }
    }
}

/// Owns the reference type instances so [`Disassembler::find_references`]
/// can borrow from them. Most architectures' types carry no per-image state
/// (a fixed opcode width), but DEX's id-table references need that image's
/// own table directory, so [`DisassemblerTypes::for_image`] is the
/// constructor callers should use instead of `default()` whenever the
/// element might be DEX.
#[derive(Default)]
pub struct DisassemblerTypes {
    pub abs32: x86::Abs32,
    pub rel32: x86::Rel32,
    pub arm32_a24: arm::Arm32A24,
    pub thumb2_bl: arm::Thumb2Bl,
    pub aarch64_immd19: arm::Aarch64Immd19,
    pub dex_string: Option<dex::DexIndex16>,
    pub dex_type: Option<dex::DexIndex16>,
    pub dex_method: Option<dex::DexIndex16>,
    pub dex_field: Option<dex::DexIndex16>,
    pub dex_rel16: dex::DexRel16,
    pub dex_rel32: dex::DexRel32,
}

impl Default for x86::Abs32 {
    fn default() -> Self {
        x86::Abs32
    }
}

impl Default for x86::Rel32 {
    fn default() -> Self {
        x86::Rel32 { opcode_width: 1 }
    }
}

impl Default for arm::Arm32A24 {
    fn default() -> Self {
        arm::Arm32A24
    }
}

impl Default for arm::Thumb2Bl {
    fn default() -> Self {
        arm::Thumb2Bl
    }
}

impl Default for arm::Aarch64Immd19 {
    fn default() -> Self {
        arm::Aarch64Immd19
    }
}

impl DisassemblerTypes {
    /// Builds the reference types for one element, resolving DEX's id-table
    /// offsets from `image`'s own header when `exe_type` is `Dex`. Every
    /// other format's types carry no per-image state, so this is equivalent
    /// to `default()` for them.
    pub fn for_image(exe_type: ExecutableType, image: ImageView<'_>) -> Self {
        let mut types = Self::default();
        if exe_type == ExecutableType::Dex {
            if let Some(layout) = DexLayout::parse(image) {
                types.dex_string = Some(dex::DexIndex16 {
                    type_tag: dex::TYPE_DEX_STRING_ID16,
                    pool_tag: dex::POOL_DEX_STRING,
                    table_offset: layout.string_ids.offset,
                    table_count: layout.string_ids.count,
                    entry_width: layout.string_ids.entry_width,
                });
                types.dex_type = Some(dex::DexIndex16 {
                    type_tag: dex::TYPE_DEX_TYPE_ID16,
                    pool_tag: dex::POOL_DEX_TYPE,
                    table_offset: layout.type_ids.offset,
                    table_count: layout.type_ids.count,
                    entry_width: layout.type_ids.entry_width,
                });
                types.dex_method = Some(dex::DexIndex16 {
                    type_tag: dex::TYPE_DEX_METHOD_ID16,
                    pool_tag: dex::POOL_DEX_METHOD,
                    table_offset: layout.method_ids.offset,
                    table_count: layout.method_ids.count,
                    entry_width: layout.method_ids.entry_width,
                });
                types.dex_field = Some(dex::DexIndex16 {
                    type_tag: dex::TYPE_DEX_FIELD_ID16,
                    pool_tag: dex::POOL_DEX_FIELD,
                    table_offset: layout.field_ids.offset,
                    table_count: layout.field_ids.count,
                    entry_width: layout.field_ids.entry_width,
                });
            }
        }
        types
    }

    /// Resolves a wire-format type tag back to the reference type that reads
    /// and writes it, for apply-time reference correction.
    pub fn by_type_tag(&self, tag: u8) -> Option<&dyn ReferenceType> {
        match tag {
            x86::TYPE_ABS32 => Some(&self.abs32),
            x86::TYPE_REL32 => Some(&self.rel32),
            arm::TYPE_ARM32_A24 => Some(&self.arm32_a24),
            arm::TYPE_THUMB2_BL => Some(&self.thumb2_bl),
            arm::TYPE_AARCH64_IMMD19 => Some(&self.aarch64_immd19),
            dex::TYPE_DEX_STRING_ID16 => self.dex_string.as_ref().map(|t| t as &dyn ReferenceType),
            dex::TYPE_DEX_TYPE_ID16 => self.dex_type.as_ref().map(|t| t as &dyn ReferenceType),
            dex::TYPE_DEX_METHOD_ID16 => self.dex_method.as_ref().map(|t| t as &dyn ReferenceType),
            dex::TYPE_DEX_FIELD_ID16 => self.dex_field.as_ref().map(|t| t as &dyn ReferenceType),
            dex::TYPE_DEX_REL16 => Some(&self.dex_rel16),
            dex::TYPE_DEX_REL32 => Some(&self.dex_rel32),
            _ => None,
        }
    }
}

fn find_dex_references<'a>(
    image: ImageView<'a>,
    translator: &AddressTranslator,
    types: &'a DisassemblerTypes,
) -> Vec<ReferenceGroup<'a>> {
    let (Some(string_id), Some(type_id), Some(method_id), Some(field_id)) =
        (&types.dex_string, &types.dex_type, &types.dex_method, &types.dex_field)
    else {
        return Vec::new();
    };
    let refs = DexReferenceTypes {
        string_id,
        type_id,
        method_id,
        field_id,
        rel16: &types.dex_rel16,
        rel32: &types.dex_rel32,
    };
    crate::arch::dex_layout::find_dex_references(image, translator, &refs)
}

fn find_x86_references<'a>(
    image: ImageView<'a>,
    translator: &AddressTranslator,
    types: &'a DisassemblerTypes,
) -> Vec<ReferenceGroup<'a>> {
    let mut abs32_refs = Vec::new();
    for location in scan_abs32(image, translator) {
        if let Some(r) = types.abs32.read(image, location, translator) {
            abs32_refs.push(r);
        }
    }
    let abs32_locations: Vec<_> = abs32_refs.iter().map(|r| (r.location, 4usize)).collect();

    let mut rel32_refs = Vec::new();
    for window in gap_windows(image.len(), &abs32_locations) {
        for location in x86::find_rel32_candidates(image, window) {
            if let Some(r) = types.rel32.read(image, location, translator) {
                rel32_refs.push(r);
            }
        }
    }

    vec![
        ReferenceGroup { reference_type: &types.abs32, references: abs32_refs },
        ReferenceGroup { reference_type: &types.rel32, references: rel32_refs },
    ]
}

fn find_arm_references<'a>(
    image: ImageView<'a>,
    translator: &AddressTranslator,
    types: &'a DisassemblerTypes,
) -> Vec<ReferenceGroup<'a>> {
    let fraction = arm::arm_condition_fraction(image, (0, image.len()));
    if fraction < arm::ARM_VS_THUMB2_THRESHOLD {
        let mut refs = Vec::new();
        let mut loc: Offset = 0;
        while (loc as usize) + 4 <= image.len() {
            if let Some(r) = types.thumb2_bl.read(image, loc, translator) {
                refs.push(r);
                loc += 4;
            } else {
                loc += 2;
            }
        }
        vec![ReferenceGroup { reference_type: &types.thumb2_bl, references: refs }]
    } else {
        let mut refs = Vec::new();
        let mut loc: Offset = 0;
        while (loc as usize) + 4 <= image.len() {
            if let Some(r) = types.arm32_a24.read(image, loc, translator) {
                refs.push(r);
            }
            loc += 4;
        }
        vec![ReferenceGroup { reference_type: &types.arm32_a24, references: refs }]
    }
}

fn find_aarch64_references<'a>(
    image: ImageView<'a>,
    translator: &AddressTranslator,
    types: &'a DisassemblerTypes,
) -> Vec<ReferenceGroup<'a>> {
    let mut refs = Vec::new();
    let mut loc: Offset = 0;
    while (loc as usize) + 4 <= image.len() {
        if let Some(r) = types.aarch64_immd19.read(image, loc, translator) {
            refs.push(r);
        }
        loc += 4;
    }
    vec![ReferenceGroup { reference_type: &types.aarch64_immd19, references: refs }]
}

/// Scans for plausible abs32 candidates: every 4-byte-aligned position whose
/// value decodes to a valid RVA under `translator`. This over-approximates
/// (plenty of random data decodes to an in-range RVA) but the image index
/// build step rejects overlaps, and the equivalence/similarity scoring in
/// practice discards spurious references that don't help compression.
fn scan_abs32(image: ImageView<'_>, translator: &AddressTranslator) -> Vec<Offset> {
    let mut out = Vec::new();
    let mut loc: Offset = 0;
    while (loc as usize) + 4 <= image.len() {
        if let Ok(rva) = image.read_u32(loc as usize) {
            if translator.is_valid_rva(rva) {
                out.push(loc);
            }
        }
        loc += 4;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_disassembler_finds_no_references() {
        let disasm = Disassembler::for_type(ExecutableType::NoOp);
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let view = ImageView::new(&data);
        let translator = disasm.build_translator(view).unwrap();
        let types = DisassemblerTypes::default();
        let groups = disasm.find_references(view, &translator, &types);
        assert!(groups.is_empty());
    }

    #[test]
    fn x86_disassembler_finds_an_abs32_pointing_inside_the_image() {
        let disasm = Disassembler::for_type(ExecutableType::Win32X86);
        let mut data = vec![0u8; 16];
        data[4..8].copy_from_slice(&4u32.to_le_bytes()); // abs32 pointing at its own location
        let view = ImageView::new(&data);
        let translator = disasm.build_translator(view).unwrap();
        let types = DisassemblerTypes::default();
        let groups = disasm.find_references(view, &translator, &types);
        let abs32_group = groups.iter().find(|g| g.reference_type.traits().type_tag == x86::TYPE_ABS32).unwrap();
        assert!(abs32_group.references.iter().any(|r| r.location == 4 && r.target == 4));
    }

    #[test]
    fn by_type_tag_resolves_every_registered_reference_type() {
        let types = DisassemblerTypes::default();
        assert!(types.by_type_tag(x86::TYPE_ABS32).is_some());
        assert!(types.by_type_tag(x86::TYPE_REL32).is_some());
        assert!(types.by_type_tag(arm::TYPE_ARM32_A24).is_some());
        assert!(types.by_type_tag(0xFE).is_none());
    }

    fn minimal_dex_with_const_string() -> Vec<u8> {
        let header_size = 0x70usize;
        let string_ids_off = header_size as u32;
        let map_off = string_ids_off + 4;

        let mut data = vec![0u8; header_size];
        data[0..8].copy_from_slice(b"dex\n035\0");
        data[0x38..0x3C].copy_from_slice(&1u32.to_le_bytes()); // string_ids_size
        data[0x3C..0x40].copy_from_slice(&string_ids_off.to_le_bytes());
        data[0x34..0x38].copy_from_slice(&map_off.to_le_bytes());

        data.extend_from_slice(&0u32.to_le_bytes()); // the one string_id entry

        let code_item_off = map_off + 4 + 12;
        data.extend_from_slice(&1u32.to_le_bytes()); // map_list size
        data.extend_from_slice(&0x2001u16.to_le_bytes()); // TYPE_CODE_ITEM
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes()); // one code item
        data.extend_from_slice(&code_item_off.to_le_bytes());

        assert_eq!(data.len() as u32, code_item_off);
        data.extend_from_slice(&0u16.to_le_bytes()); // registers_size
        data.extend_from_slice(&0u16.to_le_bytes()); // ins_size
        data.extend_from_slice(&0u16.to_le_bytes()); // outs_size
        data.extend_from_slice(&0u16.to_le_bytes()); // tries_size
        data.extend_from_slice(&0u32.to_le_bytes()); // debug_info_off
        data.extend_from_slice(&2u32.to_le_bytes()); // insns_size (code units)
        data.extend_from_slice(&[0x1a, 0x00]); // const-string v0
        data.extend_from_slice(&0u16.to_le_bytes()); // string index 0

        data
    }

    #[test]
    fn dex_disassembler_finds_a_const_string_reference() {
        let data = minimal_dex_with_const_string();
        let disasm = Disassembler::for_type(ExecutableType::Dex);
        let view = ImageView::new(&data);
        let translator = disasm.build_translator(view).unwrap();
        let types = DisassemblerTypes::for_image(ExecutableType::Dex, view);
        let groups = disasm.find_references(view, &translator, &types);

        let string_group = groups.iter().find(|g| g.reference_type.traits().type_tag == dex::TYPE_DEX_STRING_ID16).unwrap();
        assert_eq!(string_group.references.len(), 1);
        assert_eq!(string_group.references[0].target, 0x70);
    }
}
