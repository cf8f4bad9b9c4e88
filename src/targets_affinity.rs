//! Correlates old and new targets within one pool by how often references to
//! them fall inside the same equivalence, so label assignment can keep a
//! stable identity for a target across the patch even when its offset moves.

use std::collections::HashMap;

use crate::equivalence_map::Equivalence;
use crate::image_utils::{Offset, Reference};

/// Accumulated co-occurrence counts: how many times an old target and a new
/// target were both referenced from corresponding locations inside some
/// equivalence.
#[derive(Default)]
pub struct AffinityTable {
    counts: HashMap<(Offset, Offset), u32>,
    old_targets: Vec<Offset>,
    new_targets: Vec<Offset>,
}

impl AffinityTable {
    pub fn new(old_targets: Vec<Offset>, new_targets: Vec<Offset>) -> Self {
        Self { counts: HashMap::new(), old_targets, new_targets }
    }

    /// For every old reference inside an equivalence and the new reference at
    /// the corresponding offset, records one co-occurrence between their
    /// targets.
    pub fn observe(&mut self, equivalences: &[Equivalence], old_refs: &[Reference], new_refs: &[Reference]) {
        let mut new_by_location: HashMap<Offset, Offset> = HashMap::new();
        for r in new_refs {
            new_by_location.insert(r.location, r.target);
        }

        for eq in equivalences {
            for old_ref in old_refs {
                if old_ref.location < eq.src_offset || old_ref.location >= eq.src_end() {
                    continue;
                }
                let delta = old_ref.location - eq.src_offset;
                let new_location = eq.dst_offset + delta;
                if let Some(&new_target) = new_by_location.get(&new_location) {
                    *self.counts.entry((old_ref.target, new_target)).or_insert(0) += 1;
                }
            }
        }
    }

    /// Runs a greedy competitive assignment: repeatedly pick the highest
    /// remaining co-occurrence count and commit that old/new target pair,
    /// until no pair has positive affinity. Returns, for each old target (in
    /// the order given to [`Self::new`]), the index into the new targets it
    /// was matched to, or `None`.
    pub fn assign(self) -> Vec<Option<usize>> {
        let old_index: HashMap<Offset, usize> =
            self.old_targets.iter().enumerate().map(|(i, &t)| (t, i)).collect();
        let new_index: HashMap<Offset, usize> =
            self.new_targets.iter().enumerate().map(|(i, &t)| (t, i)).collect();

        let mut pairs: Vec<((Offset, Offset), u32)> = self.counts.into_iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut assignment = vec![None; self.old_targets.len()];
        let mut new_taken = vec![false; self.new_targets.len()];

        for ((old_target, new_target), count) in pairs {
            if count == 0 {
                continue;
            }
            let Some(&oi) = old_index.get(&old_target) else { continue };
            let Some(&ni) = new_index.get(&new_target) else { continue };
            if assignment[oi].is_some() || new_taken[ni] {
                continue;
            }
            assignment[oi] = Some(ni);
            new_taken[ni] = true;
        }

        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_count_wins_when_contested() {
        let mut table = AffinityTable::new(vec![10, 20], vec![100, 200]);
        *table.counts.entry((10, 100)).or_insert(0) = 5;
        *table.counts.entry((10, 200)).or_insert(0) = 1;
        *table.counts.entry((20, 100)).or_insert(0) = 9;
        let assignment = table.assign();
        assert_eq!(assignment[1], Some(0));
        assert_eq!(assignment[0], Some(1));
    }
}
