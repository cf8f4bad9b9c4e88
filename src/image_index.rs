//! Per-byte type tagging and deduplicated target pools built from the
//! reference groups a disassembler discovers.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};

use crate::address_translator::AddressTranslator;
use crate::arch::ReferenceGroup;
use crate::image_utils::{data_fits, Offset, PoolTag, Reference, TypeTag, NO_TYPE_TAG};

/// The deduplicated, sorted set of distinct targets referenced by one pool
/// (one namespace of reference types, e.g. all abs32-compatible types).
#[derive(Clone, Debug, Default)]
pub struct TargetPool {
    targets: Vec<Offset>,
}

impl TargetPool {
    fn build(mut targets: Vec<Offset>) -> Self {
        targets.sort_unstable();
        targets.dedup();
        Self { targets }
    }

    pub fn targets(&self) -> &[Offset] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Maps a target offset to its dense key (position in the sorted pool).
    pub fn key_for_target(&self, target: Offset) -> Option<u32> {
        self.targets.binary_search(&target).ok().map(|i| i as u32)
    }

    pub fn target_for_key(&self, key: u32) -> Option<Offset> {
        self.targets.get(key as usize).copied()
    }
}

/// Per-byte type tag coverage, used to keep the encoded view from treating
/// reference bytes as raw bytes and vice versa.
#[derive(Clone, Debug)]
pub struct TypeTagMap {
    tags: Vec<TypeTag>,
}

impl TypeTagMap {
    fn new(size: usize) -> Self {
        Self { tags: vec![NO_TYPE_TAG; size] }
    }

    fn mark(&mut self, location: Offset, width: usize, type_tag: TypeTag) -> Result<()> {
        let start = location as usize;
        let end = start.checked_add(width).ok_or_else(|| anyhow::anyhow!("reference width overflows"))?;
        ensure!(end <= self.tags.len(), "reference extends past image");
        for slot in &mut self.tags[start..end] {
            ensure!(*slot == NO_TYPE_TAG, "overlapping references at offset {start}");
            *slot = type_tag;
        }
        Ok(())
    }

    pub fn tag_at(&self, offset: usize) -> TypeTag {
        self.tags[offset]
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }
}

/// Ties together the type-tag coverage map, the deduplicated per-pool target
/// sets, and the raw reference locations, for one element.
pub struct ImageIndex {
    size: usize,
    tags: TypeTagMap,
    pools: BTreeMap<PoolTag, TargetPool>,
    references_by_type: BTreeMap<TypeTag, Vec<Reference>>,
    pool_of_type: BTreeMap<TypeTag, PoolTag>,
    width_of_type: BTreeMap<TypeTag, usize>,
}

impl ImageIndex {
    /// Builds an index from the reference groups a disassembler discovered,
    /// validating that no two references overlap.
    pub fn build(size: usize, groups: &[ReferenceGroup<'_>], _translator: &AddressTranslator) -> Result<Self> {
        let mut tags = TypeTagMap::new(size);
        let mut pool_targets: BTreeMap<PoolTag, Vec<Offset>> = BTreeMap::new();
        let mut references_by_type: BTreeMap<TypeTag, Vec<Reference>> = BTreeMap::new();
        let mut pool_of_type = BTreeMap::new();
        let mut width_of_type = BTreeMap::new();

        for group in groups {
            let traits = group.reference_type.traits();
            pool_of_type.insert(traits.type_tag, traits.pool_tag);
            width_of_type.insert(traits.type_tag, traits.width);
            let bucket = pool_targets.entry(traits.pool_tag).or_default();
            let refs = references_by_type.entry(traits.type_tag).or_default();
            for reference in &group.references {
                tags.mark(reference.location, traits.width, traits.type_tag)?;
                ensure!(data_fits(reference.target, 0, size), "reference target {} falls outside the image", reference.target);
                bucket.push(reference.target);
                refs.push(*reference);
            }
        }

        let pools = pool_targets.into_iter().map(|(pool, targets)| (pool, TargetPool::build(targets))).collect();

        Ok(Self { size, tags, pools, references_by_type, pool_of_type, width_of_type })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn tag_at(&self, offset: usize) -> TypeTag {
        self.tags.tag_at(offset)
    }

    pub fn pool(&self, pool_tag: PoolTag) -> Option<&TargetPool> {
        self.pools.get(&pool_tag)
    }

    pub fn pool_of_type(&self, type_tag: TypeTag) -> Option<PoolTag> {
        self.pool_of_type.get(&type_tag).copied()
    }

    pub fn width_of_type(&self, type_tag: TypeTag) -> usize {
        self.width_of_type.get(&type_tag).copied().unwrap_or(0)
    }

    pub fn references_of_type(&self, type_tag: TypeTag) -> &[Reference] {
        self.references_by_type.get(&type_tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn type_tags(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.references_by_type.keys().copied()
    }

    pub fn pool_tags(&self) -> impl Iterator<Item = PoolTag> + '_ {
        self.pools.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_translator::identity_translator;
    use crate::arch::x86::Abs32;
    use crate::arch::ReferenceType;

    #[test]
    fn pool_targets_are_sorted_and_deduplicated() {
        let translator = identity_translator(0x100).unwrap();
        let abs32 = Abs32;
        let refs = vec![
            Reference { location: 0, target: 0x40 },
            Reference { location: 4, target: 0x10 },
            Reference { location: 8, target: 0x40 },
        ];
        let groups = vec![ReferenceGroup { reference_type: &abs32, references: refs }];
        let index = ImageIndex::build(0x100, &groups, &translator).unwrap();
        let pool = index.pool(abs32.traits().pool_tag).unwrap();
        assert_eq!(pool.targets(), &[0x10, 0x40]);
        assert_eq!(pool.key_for_target(0x40), Some(1));
    }

    #[test]
    fn overlapping_references_of_the_same_type_are_rejected() {
        let translator = identity_translator(0x100).unwrap();
        let abs32 = Abs32;
        let refs = vec![Reference { location: 0, target: 0x40 }, Reference { location: 2, target: 0x40 }];
        let groups = vec![ReferenceGroup { reference_type: &abs32, references: refs }];
        assert!(ImageIndex::build(0x100, &groups, &translator).is_err());
    }

    #[test]
    fn reference_target_outside_image_is_rejected() {
        let translator = identity_translator(0x100).unwrap();
        let abs32 = Abs32;
        let refs = vec![Reference { location: 0, target: 0x200 }];
        let groups = vec![ReferenceGroup { reference_type: &abs32, references: refs }];
        assert!(ImageIndex::build(0x100, &groups, &translator).is_err());
    }
}
