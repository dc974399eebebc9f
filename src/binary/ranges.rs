//! Byte-range bookkeeping over stored parts
//!
//! All functions expect `parts` sorted by offset and non-overlapping, which
//! is what `BinaryStore` maintains: new bytes are only ever written into gaps.

use std::ops::Range;

use super::types::PartInfo;

/// Sub-ranges of `range` not covered by any part
pub fn gaps(range: &Range<u64>, parts: &[PartInfo]) -> Vec<Range<u64>> {
    let mut gaps = Vec::new();
    let mut cursor = range.start;

    for part in parts {
        if part.end() <= cursor || part.len == 0 {
            continue;
        }
        if part.offset >= range.end {
            break;
        }
        if part.offset > cursor {
            gaps.push(cursor..part.offset);
        }
        cursor = cursor.max(part.end());
        if cursor >= range.end {
            break;
        }
    }

    if cursor < range.end {
        gaps.push(cursor..range.end);
    }

    gaps
}

/// Whether `[0, total)` is fully covered
pub fn is_covered(total: u64, parts: &[PartInfo]) -> bool {
    gaps(&(0..total), parts).is_empty()
}

/// Number of bytes of `[0, total)` present
pub fn covered_len(total: u64, parts: &[PartInfo]) -> u64 {
    let missing: u64 = gaps(&(0..total), parts)
        .iter()
        .map(|gap| gap.end - gap.start)
        .sum();
    total - missing
}

/// Parts intersecting `range`, each with the absolute intersection
pub fn overlaps<'a>(
    range: &'a Range<u64>,
    parts: &'a [PartInfo],
) -> impl Iterator<Item = (PartInfo, Range<u64>)> + 'a {
    parts.iter().filter_map(move |part| {
        let start = part.offset.max(range.start);
        let end = part.end().min(range.end);
        (start < end).then_some((*part, start..end))
    })
}

/// Parts to read for `range`, each with the range relative to the part start
pub fn read_plan(range: &Range<u64>, parts: &[PartInfo]) -> Vec<(PartInfo, Range<u64>)> {
    overlaps(range, parts)
        .map(|(part, abs)| (part, (abs.start - part.offset)..(abs.end - part.offset)))
        .collect()
}

/// Split `range` into pieces of at most `size` bytes
pub fn split(range: &Range<u64>, size: u64) -> Vec<Range<u64>> {
    let size = size.max(1);
    let mut pieces = Vec::new();
    let mut start = range.start;

    while start < range.end {
        let end = start.saturating_add(size).min(range.end);
        pieces.push(start..end);
        start = end;
    }

    pieces
}
