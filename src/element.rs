//! Locates embedded executables within an image (magic probing), matches old
//! elements to new ones either from an explicit imposed-match string or by a
//! byte-histogram heuristic, and produces the final [`ElementMatch`] list the
//! generator iterates over.

use std::collections::HashMap;

use anyhow::{ensure, Context, Result};

use crate::image_utils::ExecutableType;

/// One embedded executable: its byte range within the containing image and
/// the format a disassembler should interpret it as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Element {
    pub offset: usize,
    pub size: usize,
    pub exe_type: ExecutableType,
}

/// A correspondence between one old element and one new element, the unit
/// the generator diffs independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementMatch {
    pub old: Element,
    pub new: Element,
}

fn read_u16_le(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32_le(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Probes `data` at `offset` for a recognized executable magic, returning
/// its type and a conservative size estimate. PE/ELF sizes fall back to "the
/// rest of the image" when the header fields needed for an exact size are
/// themselves out of range; callers clip against the next detected element.
fn probe(data: &[u8], offset: usize) -> Option<(ExecutableType, usize)> {
    let rest = &data[offset..];
    if rest.starts_with(b"MZ") {
        let e_lfanew = read_u32_le(rest, 0x3C)? as usize;
        let pe_header = e_lfanew.checked_add(4)?;
        if rest.get(e_lfanew..pe_header) == Some(b"PE\0\0") {
            let machine = read_u16_le(rest, pe_header)?;
            let exe_type = match machine {
                0x014C => ExecutableType::Win32X86,
                0x8664 => ExecutableType::Win32X64,
                _ => return None,
            };
            // SizeOfImage sits at the same relative offset in both PE32 and
            // PE32+ optional headers, despite their differing field widths
            // earlier on.
            let size_of_image_off = pe_header + 20 + 56;
            let size = read_u32_le(rest, size_of_image_off).map(|v| v as usize).unwrap_or(rest.len());
            return Some((exe_type, size.min(rest.len())));
        }
        return None;
    }
    if rest.starts_with(b"\x7FELF") {
        let ei_class = *rest.get(4)?;
        let machine = read_u16_le(rest, 18)?;
        let exe_type = match (ei_class, machine) {
            (1, 0x03) => ExecutableType::ElfX86,
            (2, 0x3E) => ExecutableType::ElfX64,
            (1, 0x28) => ExecutableType::ElfArm32,
            (2, 0xB7) => ExecutableType::ElfAarch64,
            _ => return None,
        };
        return Some((exe_type, rest.len()));
    }
    if rest.starts_with(b"dex\n") && rest.len() >= 0x70 {
        let file_size = read_u32_le(rest, 0x20).map(|v| v as usize).unwrap_or(rest.len());
        return Some((ExecutableType::Dex, file_size.min(rest.len())));
    }
    None
}

/// Scans `data` for embedded executables. Matches never overlap: once an
/// element is accepted, scanning resumes after its end.
pub fn detect_elements(data: &[u8]) -> Vec<Element> {
    let mut elements = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        match probe(data, offset) {
            Some((exe_type, size)) if size > 0 => {
                elements.push(Element { offset, size, exe_type });
                offset += size;
            }
            _ => offset += 1,
        }
    }
    elements
}

/// Parses an imposed-match string of the form `o+os=n+ns,o+os=n+ns,...`
/// (old offset, old size, new offset, new size, comma separated).
pub fn parse_imposed_matches(spec: &str, old_size: usize, new_size: usize) -> Result<Vec<ElementMatch>> {
    let mut matches = Vec::new();
    let mut new_ranges: Vec<(usize, usize)> = Vec::new();
    for clause in spec.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let (old_part, new_part) = clause.split_once('=').context("imposed match missing '='")?;
        let (old_offset, old_len) = parse_range(old_part)?;
        let (new_offset, new_len) = parse_range(new_part)?;
        ensure!(old_len > 0 && new_len > 0, "imposed match is zero-length: {clause}");
        ensure!(old_offset + old_len <= old_size, "imposed old range out of bounds: {clause}");
        ensure!(new_offset + new_len <= new_size, "imposed new range out of bounds: {clause}");
        let new_end = new_offset + new_len;
        ensure!(
            new_ranges.iter().all(|&(start, end)| new_end <= start || new_offset >= end),
            "imposed new range overlaps an earlier clause: {clause}"
        );
        new_ranges.push((new_offset, new_end));
        let old = Element { offset: old_offset, size: old_len, exe_type: ExecutableType::Unknown };
        let new = Element { offset: new_offset, size: new_len, exe_type: ExecutableType::Unknown };
        matches.push(ElementMatch { old, new });
    }
    Ok(matches)
}

fn parse_range(part: &str) -> Result<(usize, usize)> {
    let (offset_str, size_str) = part.split_once('+').context("imposed match range missing '+'")?;
    let offset: usize = offset_str.parse().context("invalid imposed offset")?;
    let size: usize = size_str.parse().context("invalid imposed size")?;
    Ok((offset, size))
}

/// A byte-2-gram frequency histogram, used as a cheap content fingerprint
/// for heuristic element matching.
fn histogram(data: &[u8]) -> HashMap<u16, u32> {
    let mut hist = HashMap::new();
    for w in data.windows(2) {
        let key = u16::from_le_bytes([w[0], w[1]]);
        *hist.entry(key).or_insert(0) += 1;
    }
    hist
}

/// Chi-square-style distance between two 2-gram histograms, normalized by
/// sample size so elements of different lengths remain comparable.
fn histogram_distance(a: &HashMap<u16, u32>, b: &HashMap<u16, u32>, a_len: usize, b_len: usize) -> f64 {
    if a_len == 0 || b_len == 0 {
        return f64::INFINITY;
    }
    let mut keys: Vec<u16> = a.keys().chain(b.keys()).copied().collect();
    keys.sort_unstable();
    keys.dedup();
    let mut distance = 0.0;
    for key in keys {
        let pa = *a.get(&key).unwrap_or(&0) as f64 / a_len as f64;
        let pb = *b.get(&key).unwrap_or(&0) as f64 / b_len as f64;
        distance += (pa - pb).abs();
    }
    distance
}

/// Threshold above which a candidate pairing is rejected as an outlier
/// rather than forced into a match.
const MAX_HISTOGRAM_DISTANCE: f64 = 1.2;

/// Matches old elements to new elements of the same [`ExecutableType`] by
/// minimizing 2-gram histogram distance, greedily and without replacement.
/// Candidates whose best distance still exceeds [`MAX_HISTOGRAM_DISTANCE`]
/// are left unmatched rather than forced together. When more than one DEX
/// element is present on either side, all DEX matches are dropped: Android
/// multidex splits make per-file correspondence too ambiguous to trust a
/// 2-gram heuristic.
pub fn heuristic_match(old: &[Element], new_: &[Element], old_data: &[u8], new_data: &[u8]) -> Vec<ElementMatch> {
    let dex_count_old = old.iter().filter(|e| e.exe_type == ExecutableType::Dex).count();
    let dex_count_new = new_.iter().filter(|e| e.exe_type == ExecutableType::Dex).count();
    let drop_dex = dex_count_old > 1 || dex_count_new > 1;

    let old_hists: Vec<_> = old.iter().map(|e| histogram(&old_data[e.offset..e.offset + e.size])).collect();
    let new_hists: Vec<_> = new_.iter().map(|e| histogram(&new_data[e.offset..e.offset + e.size])).collect();

    let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
    for (i, oe) in old.iter().enumerate() {
        if drop_dex && oe.exe_type == ExecutableType::Dex {
            continue;
        }
        for (j, ne) in new_.iter().enumerate() {
            if ne.exe_type != oe.exe_type {
                continue;
            }
            if drop_dex && ne.exe_type == ExecutableType::Dex {
                continue;
            }
            let distance = histogram_distance(&old_hists[i], &new_hists[j], oe.size, ne.size);
            if distance <= MAX_HISTOGRAM_DISTANCE {
                candidates.push((i, j, distance));
            }
        }
    }
    candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut old_taken = vec![false; old.len()];
    let mut new_taken = vec![false; new_.len()];
    let mut matches = Vec::new();
    for (i, j, _) in candidates {
        if old_taken[i] || new_taken[j] {
            continue;
        }
        old_taken[i] = true;
        new_taken[j] = true;
        matches.push(ElementMatch { old: old[i], new: new_[j] });
    }
    matches.sort_by_key(|m| m.old.offset);
    matches
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_single_imposed_clause() {
        let matches = parse_imposed_matches("0+10=0+12", 10, 12).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].old.size, 10);
        assert_eq!(matches[0].new.size, 12);
    }

    #[rstest]
    #[case("5+10=0+5")] // old range [5,15) is out of bounds for old_size 10
    #[case("0+5=0+5,2+5=0+5")] // overlap in new range between the two clauses
    #[case("0+0=0+0")] // zero-length clause
    fn rejects_invalid_imposed_clause(#[case] spec: &str) {
        assert!(parse_imposed_matches(spec, 10, 10).is_err());
    }

    #[test]
    fn dex_matches_are_dropped_when_multidex() {
        let old = vec![
            Element { offset: 0, size: 4, exe_type: ExecutableType::Dex },
            Element { offset: 4, size: 4, exe_type: ExecutableType::Dex },
        ];
        let new_ = vec![Element { offset: 0, size: 4, exe_type: ExecutableType::Dex }];
        let data = [0u8; 8];
        let matches = heuristic_match(&old, &new_, &data, &data);
        assert!(matches.is_empty());
    }
}
