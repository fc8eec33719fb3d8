//! Segment type and range planning.

/// A single segment: byte range [start, end) (half-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (exclusive).
    pub end: u64,
}

impl Segment {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    /// Length of this segment in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a segment plan for a given total size and segment count.
///
/// Segments are as equal as possible; earlier segments take the remainder.
/// Returns an empty vec if `total_size` is 0 or `segment_count` is 0.
pub fn plan_segments(total_size: u64, segment_count: usize) -> Vec<Segment> {
    if total_size == 0 || segment_count == 0 {
        return Vec::new();
    }

    let segment_count = (segment_count as u64).min(total_size);
    let base = total_size / segment_count;
    let remainder = total_size % segment_count;

    let mut out = Vec::with_capacity(segment_count as usize);
    let mut offset = 0u64;

    for i in 0..segment_count {
        let len = base + if i < remainder { 1 } else { 0 };
        let end = (offset + len).min(total_size);
        out.push(Segment { start: offset, end });
        offset = end;
    }

    out
}

/// Number of components for a sliced download: one per `component_size`
/// bytes (rounded up), capped at `max_components`.
pub fn component_count(total_size: u64, component_size: u64, max_components: usize) -> usize {
    if total_size == 0 {
        return 0;
    }
    let wanted = total_size.div_ceil(component_size.max(1));
    wanted.min(max_components.max(1) as u64) as usize
}

/// Byte ranges of the components of a sliced download.
pub fn plan_components(total_size: u64, component_size: u64, max_components: usize) -> Vec<Segment> {
    plan_segments(
        total_size,
        component_count(total_size, component_size, max_components),
    )
}
