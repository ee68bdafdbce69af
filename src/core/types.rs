//! Common type aliases used throughout the crate

pub use glam::{Vec2, Vec3, Vec4, UVec3};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Sentinel for "no index" in cluster/group/page/hierarchy references
pub const INVALID_INDEX: u32 = u32::MAX;

/// Inclusive index range produced by graph partitioning
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub begin: u32,
    pub end: u32,
}

impl Range {
    pub fn new(offset: u32, num: u32) -> Self {
        Self {
            begin: offset,
            end: offset + num - 1,
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// Integer division rounding up
pub fn div_round_up(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Integer division rounding to nearest
pub fn div_round_nearest(a: u32, b: u32) -> u32 {
    (a + b / 2) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        let r = Range::new(4, 3);
        assert_eq!(r.begin, 4);
        assert_eq!(r.end, 6);
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_div_rounding() {
        assert_eq!(div_round_up(10, 3), 4);
        assert_eq!(div_round_up(9, 3), 3);
        assert_eq!(div_round_nearest(10, 4), 3);
        assert_eq!(div_round_nearest(9, 4), 2);
    }
}
