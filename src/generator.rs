//! Builds a [`Patch`] from an old and new image. Raw and ensemble patches
//! share this same per-element pipeline; only the element's [`Disassembler`]
//! differs (`NoOp` contributes no reference groups, so every step involving
//! references trivially does nothing).

use std::collections::HashMap;

use anyhow::Result;

use crate::crc32::crc32;
use crate::disassembler::{Disassembler, DisassemblerTypes};
use crate::element::{detect_elements, heuristic_match, parse_imposed_matches, Element, ElementMatch};
use crate::encoded_view::EncodedView;
use crate::equivalence_map::{self, Equivalence};
use crate::image_index::ImageIndex;
use crate::image_utils::{ExecutableType, Offset, PoolTag, TypeTag};
use crate::label_manager::{OrderedLabelManager, UNUSED_LABEL};
use crate::patch::writer::write_patch;
use crate::patch::{
    ElementHeader, ElementPatch, EquivalenceRecord, ExtraTargetBlock, Patch, PatchHeader, PatchKind,
    RawDeltaRecord, ReferenceDeltaRecord,
};
use crate::targets_affinity::AffinityTable;

/// Generates a patch transforming `old` into `new`. `imposed_matches`, when
/// given, is a literal `o+os=n+ns,...` grammar string overriding automatic
/// element detection and matching.
pub fn generate(old: &[u8], new: &[u8], imposed_matches: Option<&str>) -> Result<Vec<u8>> {
    let matches = resolve_matches(old, new, imposed_matches)?;
    let patch_kind = if matches.len() > 1 {
        PatchKind::Ensemble
    } else if matches.len() == 1 && !matches!(matches[0].old.exe_type, ExecutableType::Unknown | ExecutableType::NoOp) {
        PatchKind::Single
    } else {
        PatchKind::Raw
    };

    let mut elements = Vec::with_capacity(matches.len());
    for m in &matches {
        let old_slice = &old[m.old.offset..m.old.offset + m.old.size];
        let new_slice = &new[m.new.offset..m.new.offset + m.new.size];
        let exe_type = if m.old.exe_type == ExecutableType::Unknown { ExecutableType::NoOp } else { m.old.exe_type };
        let mut element = generate_element(old_slice, new_slice, exe_type)?;
        element.header.old_offset = m.old.offset as u32;
        element.header.new_offset = m.new.offset as u32;
        elements.push(element);
    }

    let patch = Patch {
        header: PatchHeader {
            old_size: old.len() as u32,
            old_crc: crc32(old),
            new_size: new.len() as u32,
            new_crc: crc32(new),
            patch_kind,
            element_count: elements.len() as u32,
        },
        elements,
    };

    Ok(write_patch(&patch))
}

fn resolve_matches(old: &[u8], new: &[u8], imposed_matches: Option<&str>) -> Result<Vec<ElementMatch>> {
    if let Some(spec) = imposed_matches {
        return parse_imposed_matches(spec, old.len(), new.len());
    }

    let old_elements = detect_elements(old);
    let new_elements = detect_elements(new);

    if old_elements.is_empty() && new_elements.is_empty() {
        let whole_old = Element { offset: 0, size: old.len(), exe_type: ExecutableType::NoOp };
        let whole_new = Element { offset: 0, size: new.len(), exe_type: ExecutableType::NoOp };
        return Ok(vec![ElementMatch { old: whole_old, new: whole_new }]);
    }

    Ok(heuristic_match(&old_elements, &new_elements, old, new))
}

/// Builds one element's equivalence/raw-delta/reference-delta streams.
fn generate_element(old_slice: &[u8], new_slice: &[u8], exe_type: ExecutableType) -> Result<ElementPatch> {
    let old_view = crate::buffer::ImageView::new(old_slice);
    let new_view = crate::buffer::ImageView::new(new_slice);

    let disasm = Disassembler::for_type(exe_type);
    let old_translator = disasm.build_translator(old_view)?;
    let new_translator = disasm.build_translator(new_view)?;
    // DEX's id-table references carry per-image table offsets, so old and
    // new each need their own types built from their own header.
    let old_types = DisassemblerTypes::for_image(exe_type, old_view);
    let new_types = DisassemblerTypes::for_image(exe_type, new_view);

    let old_groups = disasm.find_references(old_view, &old_translator, &old_types);
    let new_groups = disasm.find_references(new_view, &new_translator, &new_types);

    let old_index = ImageIndex::build(old_slice.len(), &old_groups, &old_translator)?;
    let new_index = ImageIndex::build(new_slice.len(), &new_groups, &new_translator)?;

    // Pass 1: plain raw-byte ranks, ignoring reference aliasing, to bootstrap
    // a target affinity table.
    let old_raw_ranks: Vec<u32> = old_slice.iter().map(|&b| u32::from(b)).collect();
    let new_raw_ranks: Vec<u32> = new_slice.iter().map(|&b| u32::from(b)).collect();
    let bootstrap = equivalence_map::prune(equivalence_map::find_candidates(&old_raw_ranks, &new_raw_ranks));

    let label_space = LabelSpace::build(&old_index, &new_index, &bootstrap);

    // Pass 2: aliased ranks using the affinity-derived label correspondence.
    let old_encoded = EncodedView::new(&old_index, old_slice, |t, target| label_space.old_label(t, target));
    let new_encoded = EncodedView::new(&new_index, new_slice, |t, target| label_space.new_label(t, target));
    let old_ranks = old_encoded.ranks();
    let new_ranks = new_encoded.ranks();

    let equivalences = equivalence_map::prune(equivalence_map::find_candidates(&old_ranks, &new_ranks));

    let (equivalence_records, extra_data) = encode_equivalences(&equivalences, new_slice);
    let (raw_delta, reference_delta) = encode_corrections(&equivalences, old_slice, new_slice, &new_index, &old_index);
    let extra_targets = encode_extra_targets(&new_index, &reference_delta);

    Ok(ElementPatch {
        header: ElementHeader {
            old_offset: 0,
            new_offset: 0,
            old_length: old_slice.len() as u64,
            new_length: new_slice.len() as u64,
            exe_type,
        },
        equivalences: equivalence_records,
        extra_data,
        raw_delta,
        reference_delta,
        extra_targets,
    })
}

/// Correlates old and new targets per pool via [`AffinityTable`], producing
/// a label for every old target and, for new targets, either the label of
/// their matched old target or [`UNUSED_LABEL`].
struct LabelSpace {
    old_pool_index: HashMap<PoolTag, HashMap<Offset, usize>>,
    old_labels: HashMap<PoolTag, OrderedLabelManager>,
    new_label_of_target: HashMap<PoolTag, HashMap<Offset, u32>>,
    pool_of_type: HashMap<TypeTag, PoolTag>,
}

impl LabelSpace {
    fn build(old_index: &ImageIndex, new_index: &ImageIndex, bootstrap: &[Equivalence]) -> Self {
        let mut old_pool_index = HashMap::new();
        let mut old_labels = HashMap::new();
        let mut new_label_of_target = HashMap::new();
        let mut pool_of_type = HashMap::new();

        for t in old_index.type_tags().chain(new_index.type_tags()) {
            if let Some(p) = old_index.pool_of_type(t).or_else(|| new_index.pool_of_type(t)) {
                pool_of_type.insert(t, p);
            }
        }

        let mut pools: Vec<PoolTag> = old_index.pool_tags().chain(new_index.pool_tags()).collect();
        pools.sort_unstable();
        pools.dedup();

        for pool in pools {
            let old_targets = old_index.pool(pool).map(|p| p.targets().to_vec()).unwrap_or_default();
            let new_targets = new_index.pool(pool).map(|p| p.targets().to_vec()).unwrap_or_default();

            let old_refs: Vec<_> = old_index
                .type_tags()
                .filter(|t| old_index.pool_of_type(*t) == Some(pool))
                .flat_map(|t| old_index.references_of_type(t).to_vec())
                .collect();
            let new_refs: Vec<_> = new_index
                .type_tags()
                .filter(|t| new_index.pool_of_type(*t) == Some(pool))
                .flat_map(|t| new_index.references_of_type(t).to_vec())
                .collect();

            let mut table = AffinityTable::new(old_targets.clone(), new_targets.clone());
            table.observe(bootstrap, &old_refs, &new_refs);
            let assignment = table.assign();

            let manager = OrderedLabelManager::from_assignment(&assignment);
            let index: HashMap<Offset, usize> = old_targets.iter().enumerate().map(|(i, &t)| (t, i)).collect();

            let mut reverse: HashMap<Offset, u32> = HashMap::new();
            for (old_idx, new_idx) in assignment.iter().enumerate() {
                if let Some(new_idx) = new_idx {
                    reverse.insert(new_targets[*new_idx], manager.label(old_idx));
                }
            }

            old_pool_index.insert(pool, index);
            old_labels.insert(pool, manager);
            new_label_of_target.insert(pool, reverse);
        }

        Self { old_pool_index, old_labels, new_label_of_target, pool_of_type }
    }

    fn old_label(&self, type_tag: TypeTag, target: Offset) -> u32 {
        let Some(&pool) = self.pool_of_type.get(&type_tag) else { return UNUSED_LABEL };
        let Some(index) = self.old_pool_index.get(&pool).and_then(|m| m.get(&target)) else { return UNUSED_LABEL };
        self.old_labels.get(&pool).map(|m| m.label(*index)).unwrap_or(UNUSED_LABEL)
    }

    fn new_label(&self, type_tag: TypeTag, target: Offset) -> u32 {
        let Some(&pool) = self.pool_of_type.get(&type_tag) else { return UNUSED_LABEL };
        self.new_label_of_target.get(&pool).and_then(|m| m.get(&target)).copied().unwrap_or(UNUSED_LABEL)
    }
}

fn encode_equivalences(equivalences: &[Equivalence], new_slice: &[u8]) -> (Vec<EquivalenceRecord>, Vec<u8>) {
    let mut records = Vec::with_capacity(equivalences.len());
    let mut extra_data = Vec::new();
    let mut cursor = 0u32;
    let mut prev_src_end = 0i64;

    for eq in equivalences {
        let gap = eq.dst_offset - cursor;
        extra_data.extend_from_slice(&new_slice[cursor as usize..eq.dst_offset as usize]);
        let src_delta = eq.src_offset as i64 - prev_src_end;
        records.push(EquivalenceRecord { extra_data_gap: gap, length: eq.length, src_delta: src_delta as i32 });
        cursor = eq.dst_end();
        prev_src_end = eq.src_end() as i64;
    }
    extra_data.extend_from_slice(&new_slice[cursor as usize..]);

    (records, extra_data)
}

fn encode_corrections(
    equivalences: &[Equivalence],
    old_slice: &[u8],
    new_slice: &[u8],
    new_index: &ImageIndex,
    old_index: &ImageIndex,
) -> (Vec<RawDeltaRecord>, Vec<ReferenceDeltaRecord>) {
    let mut raw_delta = Vec::new();
    let mut reference_delta = Vec::new();
    let mut copy_cursor = 0u32;

    for eq in equivalences {
        for k in 0..eq.length {
            let old_off = eq.src_offset + k;
            let new_off = eq.dst_offset + k;
            let tag = new_index.tag_at(new_off as usize);
            if tag == crate::image_utils::NO_TYPE_TAG {
                let old_byte = old_slice[old_off as usize];
                let new_byte = new_slice[new_off as usize];
                if old_byte != new_byte {
                    let diff = new_byte.wrapping_sub(old_byte);
                    raw_delta.push(RawDeltaRecord { copy_offset: copy_cursor + k, diff });
                }
                continue;
            }
            let Some(new_ref) = new_index.references_of_type(tag).iter().find(|r| r.location == new_off) else {
                continue;
            };
            match old_index.references_of_type(tag).iter().find(|r| r.location == old_off) {
                Some(old_ref) => {
                    if new_ref.target != old_ref.target {
                        let delta = new_ref.target as i64 - old_ref.target as i64;
                        reference_delta.push(ReferenceDeltaRecord {
                            copy_offset: copy_cursor + k,
                            type_tag: tag,
                            target_delta: delta as i32,
                        });
                    }
                }
                // The aligned old position is not a reference of this type
                // (raw data, or a different type/width there): the whole
                // reference field still needs to land correctly on apply, so
                // fall back to raw-delta corrections over its encoded width
                // rather than losing the difference silently.
                None => {
                    let width = new_index.width_of_type(tag) as u32;
                    for byte_k in 0..width {
                        if k + byte_k >= eq.length {
                            break;
                        }
                        let o = (old_off + byte_k) as usize;
                        let n = (new_off + byte_k) as usize;
                        if o >= old_slice.len() || n >= new_slice.len() {
                            break;
                        }
                        let old_byte = old_slice[o];
                        let new_byte = new_slice[n];
                        if old_byte != new_byte {
                            let diff = new_byte.wrapping_sub(old_byte);
                            raw_delta.push(RawDeltaRecord { copy_offset: copy_cursor + k + byte_k, diff });
                        }
                    }
                }
            }
        }
        copy_cursor += eq.length;
    }

    (raw_delta, reference_delta)
}

fn encode_extra_targets(new_index: &ImageIndex, reference_delta: &[ReferenceDeltaRecord]) -> Vec<ExtraTargetBlock> {
    let touched_types: std::collections::HashSet<TypeTag> = reference_delta.iter().map(|r| r.type_tag).collect();
    let mut blocks = Vec::new();
    for pool_tag in new_index.pool_tags() {
        let Some(pool) = new_index.pool(pool_tag) else { continue };
        let covered_by_type = new_index.type_tags().any(|t| touched_types.contains(&t) && new_index.pool_of_type(t) == Some(pool_tag));
        if !covered_by_type && pool.is_empty() {
            continue;
        }
        blocks.push(ExtraTargetBlock { pool_tag, targets: pool.targets().to_vec() });
    }
    blocks
}

#[cfg(test)]
mod tests {
    use crate::patch::reader::read_patch;
    use crate::image_index::ImageIndex;
    use crate::equivalence_map::Equivalence;

    use super::generate;
    use super::encode_corrections;

    #[test]
    fn identity_patch_is_one_whole_equivalence() {
        let data = [0x90, 0x90, 0x90, 0x90, 0xC3];
        let patch_bytes = generate(&data, &data, None).unwrap();
        let patch = read_patch(&patch_bytes).unwrap();

        assert_eq!(patch.elements.len(), 1);
        let element = &patch.elements[0];
        assert_eq!(element.equivalences.len(), 1);
        let eq = element.equivalences[0];
        assert_eq!((eq.extra_data_gap, eq.length, eq.src_delta), (0, 5, 0));
        assert!(element.extra_data.is_empty());
        assert!(element.raw_delta.is_empty());
        assert!(element.reference_delta.is_empty());
    }

    #[test]
    fn one_byte_diff_yields_single_raw_delta() {
        let old = [0x01, 0x02, 0x03, 0x04];
        let new = [0x01, 0x02, 0xAA, 0x04];
        let patch_bytes = generate(&old, &new, None).unwrap();
        let patch = read_patch(&patch_bytes).unwrap();

        let element = &patch.elements[0];
        assert_eq!(element.equivalences.len(), 1);
        let eq = element.equivalences[0];
        assert_eq!((eq.extra_data_gap, eq.length, eq.src_delta), (0, 4, 0));
        assert!(element.extra_data.is_empty());
        assert_eq!(element.raw_delta.len(), 1);
        assert_eq!(element.raw_delta[0].copy_offset, 2);
        assert_eq!(element.raw_delta[0].diff, 0xA7); // 0x03 + 0xA7 mod 256 == 0xAA
    }

    #[test]
    fn pure_insertion_splits_into_two_equivalences() {
        let old = [0x10, 0x20];
        let new = [0x10, 0x99, 0x20];
        let patch_bytes = generate(&old, &new, None).unwrap();
        let patch = read_patch(&patch_bytes).unwrap();

        assert_eq!(patch.header.new_size, 3);
        let element = &patch.elements[0];
        assert_eq!(element.extra_data, vec![0x99]);
        let total_length: u32 = element.equivalences.iter().map(|e| e.length).sum();
        assert_eq!(total_length as usize + element.extra_data.len(), new.len());
    }

    #[test]
    fn reference_only_on_new_side_falls_back_to_raw_delta() {
        use crate::address_translator::identity_translator;
        use crate::arch::x86::Abs32;
        use crate::arch::ReferenceGroup;
        use crate::image_utils::Reference;

        // old[4..8] is plain zero bytes; new[4..8] is an abs32 reference
        // pointing at its own location. The aligned old position carries no
        // reference of the same type, so the fix must fall back to raw-delta
        // bytes instead of silently dropping the difference.
        let old_slice = [0xFFu8, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00];
        let new_slice = [0xFFu8, 0xFF, 0xFF, 0xFF, 0x04, 0x00, 0x00, 0x00];

        let translator = identity_translator(8).unwrap();
        let old_index = ImageIndex::build(8, &[], &translator).unwrap();

        let abs32 = Abs32;
        let new_groups = vec![ReferenceGroup { reference_type: &abs32, references: vec![Reference { location: 4, target: 4 }] }];
        let new_index = ImageIndex::build(8, &new_groups, &translator).unwrap();

        let equivalences = vec![Equivalence { src_offset: 0, dst_offset: 0, length: 8 }];
        let (raw_delta, reference_delta) = encode_corrections(&equivalences, &old_slice, &new_slice, &new_index, &old_index);

        assert!(reference_delta.is_empty());
        assert_eq!(raw_delta.len(), 1);
        assert_eq!(raw_delta[0].copy_offset, 4);
        assert_eq!(raw_delta[0].diff, 0x04);
    }
}
