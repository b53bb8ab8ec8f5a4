//! Segment planner - splits a resource into contiguous byte ranges

use hanash_types::Segment;

/// Split `size` bytes into contiguous segments of `part_size` bytes each.
///
/// The last segment absorbs the remainder, so no segment is shorter than
/// `part_size` except when the whole file is. A zero size yields the single
/// marker segment `0-0` (unknown-size transfer); a non-positive or oversized
/// `part_size` yields one segment covering the whole file. The returned list
/// is ordered ascending by start offset and is deterministic.
pub fn plan_segments(size: u64, part_size: u64) -> Vec<Segment> {
    if size == 0 {
        return vec![Segment::new(0, 0)];
    }

    let span = if part_size == 0 || part_size > size {
        size
    } else {
        part_size
    };
    let parts = (size / span).max(1);

    let mut result = Vec::with_capacity(parts as usize);
    let last = size - 1;
    let mut x = 0u64;
    for _ in 0..parts {
        let mut y = x + span - 1;
        // remainder shorter than a full span is folded into the last segment
        if last - y < span {
            y = last;
        }
        result.push(Segment::new(x, y));
        x = y + 1;
    }

    result
}
