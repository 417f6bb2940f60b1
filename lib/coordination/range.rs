use std::fmt;

use serde::{Deserialize, Serialize};

/// Half-open interval `[start, end)` of scan positions.
///
/// Boundaries are a pure function of the position and the configured size, so every client
/// derives the same ranges without talking to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn containing(position: u64, size: u64) -> Self {
        Self::at_index(position / size.max(1), size)
    }

    pub fn at_index(index: u64, size: u64) -> Self {
        let size = size.max(1);
        let start = index.saturating_mul(size);
        Self {
            start,
            end: start.saturating_add(size),
        }
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn index(&self) -> u64 {
        self.start / self.size().max(1)
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position < self.end
    }

    pub fn positions(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }

    /// `"{start}-{end}"`, used in store keys.
    pub fn label(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::Range;

    #[test]
    fn boundaries_depend_only_on_position_and_size() {
        let range = Range::containing(617, 300);
        assert_eq!(range, Range { start: 600, end: 900 });
        assert_eq!(range.index(), 2);
        assert_eq!(Range::at_index(2, 300), range);
        assert!(range.contains(600));
        assert!(!range.contains(900));
        assert_eq!(range.label(), "600-900");
    }
}
