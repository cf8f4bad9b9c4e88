//! Suffix array construction over a rank sequence (the encoded view's token
//! ranks), used to find candidate equivalences between an old and new image
//! without an O(n^2) byte-by-byte comparison.
//!
//! Built with the classic prefix-doubling algorithm: O(n log n) comparisons,
//! good enough for the image sizes this operates on and far simpler to keep
//! correct than DC3/SA-IS.

/// Builds the suffix array of `ranks`: `result[i]` is the starting index of
/// the `i`-th suffix in ascending lexicographic order of rank sequences.
pub fn build_suffix_array(ranks: &[u32]) -> Vec<u32> {
    let n = ranks.len();
    if n == 0 {
        return Vec::new();
    }

    let mut sa: Vec<u32> = (0..n as u32).collect();
    let mut rank: Vec<i64> = ranks.iter().map(|&r| i64::from(r)).collect();
    let mut tmp = vec![0i64; n];

    let mut k = 1usize;
    let cmp_key = |rank: &[i64], i: usize, k: usize| -> (i64, i64) {
        let n = rank.len();
        let second = if i + k < n { rank[i + k] } else { -1 };
        (rank[i], second)
    };

    while k < n {
        sa.sort_unstable_by(|&a, &b| cmp_key(&rank, a as usize, k).cmp(&cmp_key(&rank, b as usize, k)));

        tmp[sa[0] as usize] = 0;
        for i in 1..n {
            let prev = sa[i - 1] as usize;
            let cur = sa[i] as usize;
            let same = cmp_key(&rank, prev, k) == cmp_key(&rank, cur, k);
            tmp[cur] = tmp[prev] + if same { 0 } else { 1 };
        }
        rank.copy_from_slice(&tmp);

        if rank[sa[n - 1] as usize] == (n as i64 - 1) {
            break;
        }
        k *= 2;
    }

    sa
}

/// Length of the longest common prefix between the suffixes starting at `a`
/// and `b`, capped implicitly by sequence length.
pub fn longest_common_prefix(ranks: &[u32], a: usize, b: usize) -> usize {
    let n = ranks.len();
    let mut len = 0;
    while a + len < n && b + len < n && ranks[a + len] == ranks[b + len] {
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_suffixes_lexicographically() {
        let ranks = [2u32, 1, 3, 1, 2];
        let sa = build_suffix_array(&ranks);
        for w in sa.windows(2) {
            let (a, b) = (w[0] as usize, w[1] as usize);
            assert!(ranks[a..] <= ranks[b..] || ranks[a..].starts_with(&ranks[b..]));
        }
        assert_eq!(sa.len(), ranks.len());
    }

    #[test]
    fn lcp_matches_prefix_length() {
        let ranks = [1u32, 2, 3, 1, 2, 9];
        assert_eq!(longest_common_prefix(&ranks, 0, 3), 2);
    }
}
