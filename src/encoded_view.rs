//! A view over an image that aliases reference bytes by the *label* of the
//! target they resolve to, instead of their raw encoded bytes. Two pointers
//! that were relocated but still point at "the same place" encode to the
//! same token, so equivalence finding treats them as unchanged.

use crate::image_index::ImageIndex;
use crate::image_utils::{Offset, TypeTag, NO_TYPE_TAG};
use crate::label_manager::UNUSED_LABEL;

/// One position's token. Raw bytes use their own value (0-255); the first
/// byte of a reference uses a rank built from its type and label; the
/// remaining bytes of a multi-byte reference use [`Self::ReferencePadding`]
/// so the sequence length in tokens equals the sequence length in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Token {
    Raw(u8),
    ReferencePadding,
    Reference { type_tag: TypeTag, label: u32 },
}

/// Token alphabet: 0..=255 raw bytes, 256 padding, then one rank per
/// (type_tag, label) pair actually observed, assigned on first use.
pub struct EncodedView<'a> {
    index: &'a ImageIndex,
    label_of: Box<dyn Fn(TypeTag, Offset) -> u32 + 'a>,
    raw: &'a [u8],
}

impl<'a> EncodedView<'a> {
    pub fn new(index: &'a ImageIndex, raw: &'a [u8], label_of: impl Fn(TypeTag, Offset) -> u32 + 'a) -> Self {
        Self { index, label_of: Box::new(label_of), raw }
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cardinality of the alphabet in use, i.e. one past the highest
    /// rank any [`Token::Reference`] in this view can take plus the 257
    /// raw/padding values. Suffix array construction uses this to size its
    /// counting-sort buckets.
    pub fn cardinality(&self, max_label: u32) -> usize {
        258 + max_label as usize
    }

    pub fn token_at(&self, offset: usize) -> Token {
        let type_tag = self.index.tag_at(offset);
        if type_tag == NO_TYPE_TAG {
            return Token::Raw(self.raw[offset]);
        }
        match self.reference_starting_at(type_tag, offset as Offset) {
            Some(target) => Token::Reference { type_tag, label: (self.label_of)(type_tag, target) },
            None => Token::ReferencePadding,
        }
    }

    fn reference_starting_at(&self, type_tag: TypeTag, offset: Offset) -> Option<Offset> {
        self.index.references_of_type(type_tag).iter().find(|r| r.location == offset).map(|r| r.target)
    }

    /// Token rank used for ordering in the suffix array: `Raw(b)` -> `b`,
    /// `ReferencePadding` -> 256, `Reference{label,..}` -> `257 + label`.
    /// [`crate::label_manager::UNUSED_LABEL`] sorts last among references of
    /// its type so unmatched targets never spuriously equate.
    pub fn rank(&self, token: Token) -> u32 {
        match token {
            Token::Raw(b) => u32::from(b),
            Token::ReferencePadding => 256,
            Token::Reference { label, .. } if label == UNUSED_LABEL => u32::MAX,
            Token::Reference { label, .. } => 257 + label,
        }
    }

    pub fn ranks(&self) -> Vec<u32> {
        (0..self.len()).map(|i| self.rank(self.token_at(i))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_translator::identity_translator;
    use crate::arch::ReferenceGroup;

    #[test]
    fn raw_bytes_rank_as_themselves() {
        let data = [1u8, 2, 3];
        let translator = identity_translator(data.len()).unwrap();
        let index = ImageIndex::build(data.len(), &[] as &[ReferenceGroup<'_>], &translator).unwrap();
        let view = EncodedView::new(&index, &data, |_, _| 0);
        assert_eq!(view.ranks(), vec![1, 2, 3]);
    }
}
