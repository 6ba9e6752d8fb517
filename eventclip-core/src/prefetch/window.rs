//! Index windows over a scroll list.

use std::ops::Range;

/// Indices to prefetch: `behind` slots before `current` and `ahead` after,
/// clamped to `0..len`.
pub fn prefetch_range(len: usize, current: usize, behind: usize, ahead: usize) -> Range<usize> {
    clamped(len, current, behind, ahead)
}

/// Indices tolerated in cache during eviction: `radius` slots on each side.
pub fn keep_range(len: usize, current: usize, radius: usize) -> Range<usize> {
    clamped(len, current, radius, radius)
}

fn clamped(len: usize, current: usize, before: usize, after: usize) -> Range<usize> {
    if len == 0 {
        return 0..0;
    }
    let current = current.min(len - 1);
    let start = current.saturating_sub(before);
    let end = current.saturating_add(after).saturating_add(1).min(len);
    start..end
}
