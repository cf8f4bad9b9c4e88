//! Seed-and-extend equivalence finding: candidate equal runs between the old
//! and new encoded views, scored by length against the extra-data they'd
//! still require to reproduce a mismatched region, then pruned so the final
//! equivalence map has no overlaps.

use std::cmp::Ordering;

use crate::suffix_array::build_suffix_array;

/// One claimed equal run: `length` tokens starting at `src_offset` in the
/// old image reproduce the new image's tokens starting at `dst_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Equivalence {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub length: u32,
}

impl Equivalence {
    pub fn src_end(&self) -> u32 {
        self.src_offset + self.length
    }

    pub fn dst_end(&self) -> u32 {
        self.dst_offset + self.length
    }
}

/// A scored candidate produced during seed-and-extend, before pruning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EquivalenceCandidate {
    pub equivalence: Equivalence,
    pub similarity: i64,
}

/// Per-byte similarity contribution: exact matches score positively, a run
/// that needed extension through mismatched bytes is penalized, mirroring
/// the reference implementation's greedy-extension-with-running-penalty.
fn extension_bonus(matched: bool) -> i64 {
    if matched {
        1
    } else {
        -2
    }
}

/// Greedily extends a seed match at `(src, dst)` in both directions across
/// `old_ranks`/`new_ranks`, allowing the match to cross occasional
/// mismatches as long as the running penalty never goes negative, then
/// truncates back to the last position where the penalty was at its best.
fn extend(old_ranks: &[u32], new_ranks: &[u32], src: usize, dst: usize, seed_len: usize) -> Equivalence {
    let mut best_forward = seed_len;
    let mut penalty = 0i64;
    let mut best_penalty = 0i64;
    let mut i = seed_len;
    while src + i < old_ranks.len() && dst + i < new_ranks.len() {
        let matched = old_ranks[src + i] == new_ranks[dst + i];
        penalty += extension_bonus(matched);
        if penalty > best_penalty {
            best_penalty = penalty;
            best_forward = i + 1;
        } else if penalty < best_penalty - 16 {
            break;
        }
        i += 1;
    }

    let mut best_backward = 0usize;
    penalty = 0;
    best_penalty = 0;
    let mut j = 1usize;
    while j <= src && j <= dst {
        let matched = old_ranks[src - j] == new_ranks[dst - j];
        penalty += extension_bonus(matched);
        if penalty > best_penalty {
            best_penalty = penalty;
            best_backward = j;
        } else if penalty < best_penalty - 16 {
            break;
        }
        j += 1;
    }

    Equivalence {
        src_offset: (src - best_backward) as u32,
        dst_offset: (dst - best_backward) as u32,
        length: (best_backward + best_forward) as u32,
    }
}

fn similarity(equivalence: &Equivalence, old_ranks: &[u32], new_ranks: &[u32]) -> i64 {
    let mut score = 0i64;
    for k in 0..equivalence.length as usize {
        let matched = old_ranks[equivalence.src_offset as usize + k] == new_ranks[equivalence.dst_offset as usize + k];
        score += extension_bonus(matched);
    }
    score
}

/// Finds candidate equivalences by seeding from every position of `new_sa`
/// matched via binary search against `old_sa`, then extending each seed.
/// Returns candidates sorted by descending similarity (ties by longer
/// length), ready for pruning.
pub fn find_candidates(old_ranks: &[u32], new_ranks: &[u32]) -> Vec<EquivalenceCandidate> {
    let old_sa = build_suffix_array(old_ranks);
    let mut candidates = Vec::new();

    if old_ranks.is_empty() || new_ranks.is_empty() {
        return candidates;
    }

    let mut dst = 0usize;
    while dst < new_ranks.len() {
        let (src, seed_len) = best_seed(old_ranks, &old_sa, new_ranks, dst);
        if seed_len == 0 {
            dst += 1;
            continue;
        }
        let equivalence = extend(old_ranks, new_ranks, src, dst, seed_len);
        let similarity = similarity(&equivalence, old_ranks, new_ranks);
        if similarity > 0 {
            dst = equivalence.dst_end() as usize;
            candidates.push(EquivalenceCandidate { equivalence, similarity });
            continue;
        }
        dst += 1;
    }

    candidates.sort_by(|a, b| {
        b.similarity.cmp(&a.similarity).then_with(|| b.equivalence.length.cmp(&a.equivalence.length))
    });
    candidates
}

/// Binary searches `old_sa` for the suffix with the longest common prefix
/// against `new_ranks[dst..]`, returning its source offset and match length.
fn best_seed(old_ranks: &[u32], old_sa: &[u32], new_ranks: &[u32], dst: usize) -> (usize, usize) {
    let target = &new_ranks[dst..];
    let cmp = |suffix_start: u32| -> Ordering {
        let suffix = &old_ranks[suffix_start as usize..];
        suffix.cmp(target)
    };

    let idx = old_sa.partition_point(|&s| cmp(s) == Ordering::Less);
    let mut best = (0usize, 0usize);
    for &candidate in old_sa[idx.saturating_sub(1)..(idx + 1).min(old_sa.len())].iter() {
        let lcp = longest_common_prefix_against(old_ranks, candidate as usize, target);
        if lcp > best.1 {
            best = (candidate as usize, lcp);
        }
    }
    best
}

fn longest_common_prefix_against(old_ranks: &[u32], src: usize, target: &[u32]) -> usize {
    let mut len = 0;
    while src + len < old_ranks.len() && len < target.len() && old_ranks[src + len] == target[len] {
        len += 1;
    }
    len
}

/// Resolves overlaps among scored candidates, preferring higher similarity,
/// and merges the result into a non-overlapping, offset-ordered equivalence
/// map (the source and destination ranges of any two kept equivalences are
/// disjoint).
pub fn prune(mut candidates: Vec<EquivalenceCandidate>) -> Vec<Equivalence> {
    let mut kept: Vec<Equivalence> = Vec::new();
    candidates.sort_by(|a, b| b.similarity.cmp(&a.similarity));

    for candidate in candidates {
        let e = candidate.equivalence;
        let overlaps = kept.iter().any(|k| {
            ranges_overlap(k.dst_offset, k.dst_end(), e.dst_offset, e.dst_end())
                || ranges_overlap(k.src_offset, k.src_end(), e.src_offset, e.src_end())
        });
        if !overlaps {
            kept.push(e);
        }
    }

    kept.sort_by_key(|e| e.dst_offset);
    kept
}

fn ranges_overlap(a_begin: u32, a_end: u32, b_begin: u32, b_end: u32) -> bool {
    a_begin < b_end && b_begin < a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sequences_produce_one_full_equivalence() {
        let data: Vec<u32> = (0..64).collect();
        let candidates = find_candidates(&data, &data);
        let map = prune(candidates);
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].length as usize, data.len());
    }

    #[test]
    fn pruning_drops_overlaps_keeping_higher_similarity() {
        let a = Equivalence { src_offset: 0, dst_offset: 0, length: 10 };
        let b = Equivalence { src_offset: 5, dst_offset: 5, length: 10 };
        let candidates = vec![
            EquivalenceCandidate { equivalence: a, similarity: 10 },
            EquivalenceCandidate { equivalence: b, similarity: 3 },
        ];
        let pruned = prune(candidates);
        assert_eq!(pruned, vec![a]);
    }
}
