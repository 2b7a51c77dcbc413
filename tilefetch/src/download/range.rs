//! Byte range decomposition.

use std::fmt;

/// An inclusive byte interval `[lower, upper]` of the remote content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub lower: u64,
    pub upper: u64,
}

impl ByteRange {
    pub fn new(lower: u64, upper: u64) -> Self {
        debug_assert!(lower <= upper);
        Self { lower, upper }
    }

    /// Number of bytes covered by this range.
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    /// A range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value of the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.lower, self.upper)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lower, self.upper)
    }
}

/// Split `content_length` bytes into consecutive ranges of `chunk_size`.
///
/// The last range absorbs whatever is left and may be short. Returns an
/// empty list when `content_length` is zero; a zero `chunk_size` is treated
/// as one.
pub fn build_ranges(content_length: u64, chunk_size: u64) -> Vec<ByteRange> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::with_capacity(content_length.div_ceil(chunk_size) as usize);

    let mut lower = 0;
    while lower < content_length {
        let upper = lower.saturating_add(chunk_size - 1).min(content_length - 1);
        ranges.push(ByteRange::new(lower, upper));
        lower = upper + 1;
    }

    ranges
}
