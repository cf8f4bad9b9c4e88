//! Bidirectional mapping between file offsets and runtime virtual addresses,
//! with a fake-offset device for dangling RVAs that have no file offset.
//!
//! Grounded on `address_translator.{h,cc}`: units are built from
//! `(offset_begin, offset_size, rva_begin, rva_size)` quadruples, sorted and
//! merged by RVA, then checked for offset overlap, exactly as the reference
//! implementation does it.

use anyhow::{anyhow, Result};

use crate::image_utils::{Offset, Rva};

const OFFSET_BOUND: u64 = 1u64 << 31;
const RVA_BOUND: u64 = 1u64 << 32;

fn range_is_bounded(begin: u64, size: u64, bound: u64) -> bool {
    match begin.checked_add(size) {
        Some(end) => end <= bound,
        None => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Unit {
    offset_begin: Offset,
    offset_size: Offset,
    rva_begin: Rva,
    rva_size: Rva,
}

impl Unit {
    fn offset_end(&self) -> Offset {
        self.offset_begin + self.offset_size
    }

    fn rva_end(&self) -> Rva {
        self.rva_begin + self.rva_size
    }

    fn has_dangling_rva(&self) -> bool {
        self.rva_size > self.offset_size
    }

    fn covers_offset(&self, offset: Offset) -> bool {
        offset >= self.offset_begin && offset < self.offset_end()
    }

    fn covers_rva(&self, rva: Rva) -> bool {
        rva >= self.rva_begin && rva < self.rva_end()
    }

    fn covers_dangling_rva(&self, rva: Rva) -> bool {
        self.has_dangling_rva() && rva >= self.rva_begin + self.offset_size && rva < self.rva_end()
    }

    fn offset_to_rva_unsafe(&self, offset: Offset) -> Rva {
        offset - self.offset_begin + self.rva_begin
    }

    fn rva_to_offset_unsafe(&self, rva: Rva, fake_offset_begin: Offset) -> Offset {
        if self.covers_dangling_rva(rva) {
            fake_offset_begin + (rva - self.rva_begin)
        } else {
            rva - self.rva_begin + self.offset_begin
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorError {
    Overflow,
    BadOverlap,
    BadOverlapDanglingRva,
    FakeOffsetBeginTooLarge,
}

impl std::fmt::Display for TranslatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Overflow => "address unit range overflows addressable bounds",
            Self::BadOverlap => "address units overlap with inconsistent offset shift",
            Self::BadOverlapDanglingRva => "address units overlap with inconsistent dangling RVA extent",
            Self::FakeOffsetBeginTooLarge => "fake-offset base plus RVA span exceeds the offset bound",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TranslatorError {}

/// Bidirectional offset <-> RVA mapping built by [`AddressTranslatorBuilder`].
#[derive(Clone, Debug, Default)]
pub struct AddressTranslator {
    units_by_offset: Vec<Unit>,
    units_by_rva: Vec<Unit>,
    fake_offset_begin: Offset,
}

impl AddressTranslator {
    fn unit_for_offset(&self, offset: Offset) -> Option<&Unit> {
        let idx = self.units_by_offset.partition_point(|u| u.offset_begin <= offset);
        if idx == 0 {
            return None;
        }
        let unit = &self.units_by_offset[idx - 1];
        unit.covers_offset(offset).then_some(unit)
    }

    fn unit_for_rva(&self, rva: Rva) -> Option<&Unit> {
        let idx = self.units_by_rva.partition_point(|u| u.rva_begin <= rva);
        if idx == 0 {
            return None;
        }
        let unit = &self.units_by_rva[idx - 1];
        unit.covers_rva(rva).then_some(unit)
    }

    pub fn offset_to_rva(&self, offset: Offset) -> Option<Rva> {
        if offset >= self.fake_offset_begin {
            let rva = offset - self.fake_offset_begin;
            let unit = self.unit_for_rva(rva)?;
            return unit.covers_dangling_rva(rva).then_some(rva);
        }
        self.unit_for_offset(offset).map(|u| u.offset_to_rva_unsafe(offset))
    }

    pub fn rva_to_offset(&self, rva: Rva) -> Option<Offset> {
        self.unit_for_rva(rva).map(|u| u.rva_to_offset_unsafe(rva, self.fake_offset_begin))
    }

    pub fn is_valid_rva(&self, rva: Rva) -> bool {
        self.unit_for_rva(rva).is_some()
    }

    pub fn is_valid_offset(&self, offset: Offset) -> bool {
        if offset >= self.fake_offset_begin {
            return self.offset_to_rva(offset).is_some();
        }
        self.unit_for_offset(offset).is_some()
    }
}

/// Sequential-query cache wrapping an [`AddressTranslator`] for offset to RVA
/// lookups; amortizes to O(1) when queries are made in ascending order.
pub struct CachedOffsetToRva<'a> {
    translator: &'a AddressTranslator,
    cached: Option<usize>,
}

impl<'a> CachedOffsetToRva<'a> {
    pub fn new(translator: &'a AddressTranslator) -> Self {
        Self { translator, cached: None }
    }

    pub fn convert(&mut self, offset: Offset) -> Option<Rva> {
        if offset >= self.translator.fake_offset_begin {
            return self.translator.offset_to_rva(offset);
        }
        if let Some(idx) = self.cached {
            let unit = &self.translator.units_by_offset[idx];
            if unit.covers_offset(offset) {
                return Some(unit.offset_to_rva_unsafe(offset));
            }
        }
        let idx = self.translator.units_by_offset.partition_point(|u| u.offset_begin <= offset);
        if idx == 0 {
            return None;
        }
        let unit = &self.translator.units_by_offset[idx - 1];
        if !unit.covers_offset(offset) {
            return None;
        }
        self.cached = Some(idx - 1);
        Some(unit.offset_to_rva_unsafe(offset))
    }
}

/// Builds an [`AddressTranslator`] from a series of address units.
#[derive(Default)]
pub struct AddressTranslatorBuilder {
    units: Vec<Unit>,
}

impl AddressTranslatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one unit. Overflowing ranges are rejected; `offset_size` larger
    /// than `rva_size` is silently truncated; empty units are discarded.
    pub fn add_unit(
        &mut self,
        offset_begin: Offset,
        offset_size: Offset,
        rva_begin: Rva,
        rva_size: Rva,
    ) -> Result<(), TranslatorError> {
        if !range_is_bounded(offset_begin as u64, offset_size as u64, OFFSET_BOUND)
            || !range_is_bounded(rva_begin as u64, rva_size as u64, RVA_BOUND)
        {
            return Err(TranslatorError::Overflow);
        }
        let offset_size = offset_size.min(rva_size);
        if rva_size > 0 {
            self.units.push(Unit { offset_begin, offset_size, rva_begin, rva_size });
        }
        Ok(())
    }

    pub fn build(mut self) -> Result<AddressTranslator, TranslatorError> {
        self.units.sort_by_key(|u| (u.rva_begin, u.rva_size));
        self.units.dedup();

        if self.units.len() > 1 {
            let mut merged: Vec<Unit> = Vec::with_capacity(self.units.len());
            merged.push(self.units[0]);
            for fast in &self.units[1..] {
                let slow = merged.last_mut().unwrap();
                if slow.rva_end() < fast.rva_begin {
                    merged.push(*fast);
                    continue;
                }
                let merge_is_optional = slow.rva_end() == fast.rva_begin;
                let shift_matches = fast.offset_begin >= slow.offset_begin
                    && fast.offset_begin - slow.offset_begin == fast.rva_begin - slow.rva_begin;
                if !shift_matches {
                    if merge_is_optional {
                        merged.push(*fast);
                        continue;
                    }
                    return Err(TranslatorError::BadOverlap);
                }
                let dangling_consistent = !((fast.has_dangling_rva() && fast.offset_end() < slow.offset_end())
                    || (slow.has_dangling_rva() && slow.offset_end() < fast.offset_end()));
                if !dangling_consistent {
                    if merge_is_optional {
                        merged.push(*fast);
                        continue;
                    }
                    return Err(TranslatorError::BadOverlapDanglingRva);
                }
                slow.rva_size = slow.rva_size.max(fast.rva_end() - slow.rva_begin);
                slow.offset_size = slow.offset_size.max(fast.offset_end() - slow.offset_begin);
            }
            self.units = merged;
        }

        self.units.sort_by_key(|u| u.offset_begin);
        for w in self.units.windows(2) {
            if w[0].offset_end() > w[1].offset_begin {
                return Err(TranslatorError::BadOverlap);
            }
        }

        let mut offset_bound: Offset = 0;
        let mut rva_bound: Rva = 0;
        for unit in &self.units {
            offset_bound = offset_bound.max(unit.offset_end());
            rva_bound = rva_bound.max(unit.rva_end());
        }

        if !range_is_bounded(offset_bound as u64, rva_bound as u64, OFFSET_BOUND) {
            return Err(TranslatorError::FakeOffsetBeginTooLarge);
        }

        let units_by_offset = self.units.clone();
        let mut units_by_rva = self.units;
        units_by_rva.sort_by_key(|u| u.rva_begin);

        Ok(AddressTranslator { units_by_offset, units_by_rva, fake_offset_begin: offset_bound })
    }
}

/// Builds a simple one-unit identity translator: offset == rva for the
/// entire image. Used by disassemblers that have no section table to derive
/// a richer mapping from (e.g. [`crate::image_utils::ExecutableType::NoOp`]).
pub fn identity_translator(size: usize) -> Result<AddressTranslator> {
    let size: u32 = size.try_into().map_err(|_| anyhow!("image too large"))?;
    let mut builder = AddressTranslatorBuilder::new();
    if size > 0 {
        builder.add_unit(0, size, 0, size).map_err(|e| anyhow!(e.to_string()))?;
    }
    builder.build().map_err(|e| anyhow!(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple() {
        let mut b = AddressTranslatorBuilder::new();
        b.add_unit(0, 0x1000, 0x1000, 0x1000).unwrap();
        let t = b.build().unwrap();
        for off in [0u32, 0x500, 0xFFF] {
            let rva = t.offset_to_rva(off).unwrap();
            assert_eq!(t.rva_to_offset(rva).unwrap(), off);
        }
    }

    #[test]
    fn dangling_rva_uses_fake_offset() {
        let mut b = AddressTranslatorBuilder::new();
        // 0x10 bytes backed on disk, but section spans 0x20 bytes of RVA.
        b.add_unit(0, 0x10, 0x1000, 0x20).unwrap();
        let t = b.build().unwrap();
        let dangling_rva = 0x1018;
        let fake = t.rva_to_offset(dangling_rva).unwrap();
        assert!(fake >= t.fake_offset_begin);
        assert_eq!(t.offset_to_rva(fake).unwrap(), dangling_rva);
    }

    #[test]
    fn bad_overlap_is_rejected() {
        let mut b = AddressTranslatorBuilder::new();
        b.add_unit(0, 0x20, 0x1000, 0x20).unwrap();
        b.add_unit(0x10, 0x20, 0x1010, 0x20).unwrap();
        assert!(matches!(b.build(), Err(TranslatorError::BadOverlap)));
    }

    #[test]
    fn tangent_units_with_mismatched_shift_stay_separate() {
        let mut b = AddressTranslatorBuilder::new();
        b.add_unit(0, 0x10, 0x1000, 0x10).unwrap();
        b.add_unit(0x100, 0x10, 0x1010, 0x10).unwrap();
        let t = b.build().unwrap();
        assert_eq!(t.offset_to_rva(0).unwrap(), 0x1000);
        assert_eq!(t.offset_to_rva(0x100).unwrap(), 0x1010);
    }
}
