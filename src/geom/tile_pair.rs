use super::{Tile, TwinCode, ZoomLevels, TWIN_EAST, TWIN_NONE, TWIN_SOUTH};

/// Which edge neighbor completes the pair. The first tile is always the
/// northwest-most, so a twin can only lie east or south of it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum PairDir {
    #[default]
    Single,
    East,
    South,
}

impl PairDir {
    pub fn code(self) -> u32 {
        match self {
            PairDir::Single => 0,
            PairDir::East => 1,
            PairDir::South => 2,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => PairDir::Single,
            1 => PairDir::East,
            2 => PairDir::South,
            _ => unreachable!("bad pair dir"),
        }
    }
}

/// One tile, or a tile plus one of its edge neighbors forming a 1×2 or
/// 2×1 rectangle. Accumulating tiles zooms the pair out as needed so it
/// stays a legal pair.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TilePair {
    first: Tile,
    dir: PairDir,
}

impl TilePair {
    pub fn single(tile: Tile) -> Self {
        TilePair { first: tile, dir: PairDir::Single }
    }

    #[inline]
    pub fn first(self) -> Tile {
        self.first
    }

    #[inline]
    pub fn dir(self) -> PairDir {
        self.dir
    }

    #[inline]
    pub fn zoom(self) -> u32 {
        self.first.zoom()
    }

    #[inline]
    pub fn has_second(self) -> bool {
        self.dir != PairDir::Single
    }

    pub fn second(self) -> Option<Tile> {
        match self.dir {
            PairDir::Single => None,
            PairDir::East => self.first.twin(TWIN_EAST),
            PairDir::South => self.first.twin(TWIN_SOUTH),
        }
    }

    /// Grow the pair to also cover `tile`, zooming out until the union is
    /// again a single tile or an edge pair.
    pub fn add(self, tile: Tile) -> TilePair {
        let mut zoom = self.zoom().min(tile.zoom());
        loop {
            let a = self.first.zoomed_out(zoom);
            let b = match self.second() {
                Some(s) => s.zoomed_out(zoom),
                None => a,
            };
            let c = tile.zoomed_out(zoom);
            let min_col = a.column().min(b.column()).min(c.column());
            let max_col = a.column().max(b.column()).max(c.column());
            let min_row = a.row().min(b.row()).min(c.row());
            let max_row = a.row().max(b.row()).max(c.row());
            let (w, h) = (max_col - min_col, max_row - min_row);
            let dir = match (w, h) {
                (0, 0) => Some(PairDir::Single),
                (1, 0) => Some(PairDir::East),
                (0, 1) => Some(PairDir::South),
                _ => None,
            };
            if let Some(dir) = dir {
                return TilePair { first: Tile::new(zoom, min_col, min_row), dir };
            }
            debug_assert!(zoom > 0);
            zoom -= 1;
        }
    }

    /// Reduce the pair to the nearest catalogued zoom level. Zooming out can
    /// merge the two tiles into one, or leave the pair diagonal for one step,
    /// in which case we keep ascending.
    pub fn normalized(self, levels: ZoomLevels) -> TilePair {
        let mut pair = self;
        loop {
            let zoom = levels.parent_zoom(pair.zoom());
            if zoom == pair.zoom() {
                return pair;
            }
            let a = pair.first.zoomed_out(zoom);
            pair = match pair.second() {
                Some(s) => TilePair::single(a).add(s.zoomed_out(zoom)),
                None => TilePair::single(a),
            };
        }
    }

    /// The direction from `tile` (one of the pair's members, zoomed to the
    /// pair's level) to its twin; `TWIN_NONE` for a single.
    pub fn twin_code_from(self, tile: Tile) -> TwinCode {
        let tile = tile.zoomed_out(self.zoom());
        match self.second() {
            None => TWIN_NONE,
            Some(second) => {
                if tile == self.first {
                    self.first.twin_code_of(second).expect("pair tiles must be twins")
                } else {
                    debug_assert_eq!(tile, second);
                    second.twin_code_of(self.first).expect("pair tiles must be twins")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{TWIN_NORTH, TWIN_WEST};

    #[test]
    fn adding_the_east_neighbor_forms_a_pair() {
        let a = Tile::new(12, 100, 50);
        let pair = TilePair::single(a).add(Tile::new(12, 101, 50));
        assert_eq!(pair.first(), a);
        assert_eq!(pair.dir(), PairDir::East);
        assert_eq!(pair.second(), Some(Tile::new(12, 101, 50)));
    }

    #[test]
    fn first_tile_is_northwest_most() {
        let pair = TilePair::single(Tile::new(12, 101, 50)).add(Tile::new(12, 100, 50));
        assert_eq!(pair.first(), Tile::new(12, 100, 50));
        assert_eq!(pair.dir(), PairDir::East);
        let pair = TilePair::single(Tile::new(12, 7, 9)).add(Tile::new(12, 7, 8));
        assert_eq!(pair.first(), Tile::new(12, 7, 8));
        assert_eq!(pair.dir(), PairDir::South);
    }

    #[test]
    fn diagonal_tiles_zoom_out() {
        // Diagonal neighbors can never form a pair at their own zoom.
        let pair = TilePair::single(Tile::new(12, 100, 50)).add(Tile::new(12, 101, 51));
        assert_eq!(pair.zoom(), 11);
        assert_eq!(pair.first(), Tile::new(11, 50, 25));
        assert_eq!(pair.dir(), PairDir::Single);
    }

    #[test]
    fn distant_tiles_zoom_until_they_fit() {
        let pair = TilePair::single(Tile::new(12, 0, 0)).add(Tile::new(12, 4095, 4095));
        assert_eq!(pair.zoom(), 0);
        assert_eq!(pair.dir(), PairDir::Single);
    }

    #[test]
    fn normalize_ascends_to_catalogued_level() {
        let levels = ZoomLevels::default();
        // An 11-zoom pair must land on zoom 10
        let pair = TilePair::single(Tile::new(12, 100, 50)).add(Tile::new(12, 101, 51));
        assert_eq!(pair.zoom(), 11);
        let norm = pair.normalized(levels);
        assert_eq!(norm.zoom(), 10);
        // A same-parent east pair at 12 stays at 12
        let pair = TilePair::single(Tile::new(12, 100, 50)).add(Tile::new(12, 101, 50));
        assert_eq!(pair.normalized(levels), pair);
    }

    #[test]
    fn twin_codes_from_each_member() {
        let pair = TilePair::single(Tile::new(12, 100, 50)).add(Tile::new(12, 101, 50));
        assert_eq!(pair.twin_code_from(Tile::new(12, 100, 50)), TWIN_EAST);
        assert_eq!(pair.twin_code_from(Tile::new(12, 101, 50)), TWIN_WEST);
        let pair = TilePair::single(Tile::new(12, 7, 8)).add(Tile::new(12, 7, 9));
        assert_eq!(pair.twin_code_from(Tile::new(12, 7, 8)), TWIN_SOUTH);
        assert_eq!(pair.twin_code_from(Tile::new(12, 7, 9)), TWIN_NORTH);
    }
}
