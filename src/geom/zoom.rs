use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use super::MAX_ZOOM;

/// The set of zoom levels at which tiles are catalogued. Level 0 is always
/// present; levels may not be more than 3 apart (a parent-tile locator
/// stores the delta in 4 bits, and sparse pyramids degrade tile locality).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ZoomLevels(u16);

impl Default for ZoomLevels {
    fn default() -> Self {
        // 0/2/4/6/8/10/12
        ZoomLevels(0b1_0101_0101_0101)
    }
}

impl ZoomLevels {
    pub fn from_levels(levels: &[u32]) -> Result<Self> {
        let mut bits: u16 = 1; // level 0 is implied
        for &level in levels {
            ensure!(level <= MAX_ZOOM, "Zoom level {level} out of range (0-{MAX_ZOOM})");
            bits |= 1 << level;
        }
        let zl = ZoomLevels(bits);
        let mut prev = 0;
        for level in 1..=MAX_ZOOM {
            if zl.contains(level) {
                ensure!(
                    level - prev <= 3,
                    "Gap between zoom levels {prev} and {level} is too large (max 3)"
                );
                prev = level;
            }
        }
        Ok(zl)
    }

    #[inline]
    pub fn contains(self, level: u32) -> bool {
        self.0 & (1 << level) != 0
    }

    /// The deepest catalogued level at or above (i.e. not deeper than) `zoom`.
    pub fn parent_zoom(self, zoom: u32) -> u32 {
        let mut z = zoom.min(MAX_ZOOM);
        while z > 0 && !self.contains(z) {
            z -= 1;
        }
        z
    }

    /// The deepest catalogued level overall.
    pub fn leaf_zoom(self) -> u32 {
        31 - (self.0 as u32).leading_zeros()
    }

    pub fn iter(self) -> impl Iterator<Item = u32> {
        let bits = self.0;
        (0..=MAX_ZOOM).filter(move |&z| bits & (1 << z) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_levels() {
        let zl = ZoomLevels::default();
        assert_eq!(zl.iter().collect::<Vec<_>>(), vec![0, 2, 4, 6, 8, 10, 12]);
        assert_eq!(zl.leaf_zoom(), 12);
    }

    #[test]
    fn parent_zoom_ascends_to_nearest_level() {
        let zl = ZoomLevels::default();
        assert_eq!(zl.parent_zoom(12), 12);
        assert_eq!(zl.parent_zoom(11), 10);
        assert_eq!(zl.parent_zoom(1), 0);
        assert_eq!(zl.parent_zoom(0), 0);
    }

    #[test]
    fn rejects_wide_gaps() {
        assert!(ZoomLevels::from_levels(&[4, 8]).is_err());
        assert!(ZoomLevels::from_levels(&[3, 6, 9, 12]).is_ok());
        assert!(ZoomLevels::from_levels(&[13]).is_err());
    }
}
