use std::io::Write;
use std::path::Path;

use ahash::AHashMap;
use anyhow::{Context, Result};

use super::TileLayout;
use crate::geom::{Coordinate, PairDir, Tile, TilePair, ZoomLevels, MAX_ZOOM};

/// The read-only tile lookup used by every phase after analyze.
///
/// Piles are 1-based; 0 means "absent". A pile pair is
/// `(first_pile << 2) | dir` with `dir` 0 = single, 1 = second tile east,
/// 2 = second tile south.
pub struct TileCatalog {
    levels: ZoomLevels,
    pile_to_tile: Vec<Tile>,
    tile_to_pile: AHashMap<Tile, u32>,
    cell_to_pile: Vec<u32>,
    estimates: Vec<u64>,
}

impl TileCatalog {
    pub fn build(layout: TileLayout) -> TileCatalog {
        TileCatalog {
            levels: layout.levels,
            pile_to_tile: layout.pile_to_tile,
            tile_to_pile: layout.tile_to_pile,
            cell_to_pile: layout.cell_to_pile,
            estimates: layout.estimates,
        }
    }

    #[inline]
    pub fn tile_count(&self) -> u32 {
        (self.pile_to_tile.len() - 1) as u32
    }

    #[inline]
    pub fn levels(&self) -> ZoomLevels {
        self.levels
    }

    /// Estimated bytes for each pile (1-based, index 0 unused).
    pub fn pile_estimates(&self) -> &[u64] {
        &self.estimates
    }

    /// O(1) via the zoom-12 cell grid.
    #[inline]
    pub fn pile_of_coordinate(&self, c: Coordinate) -> u32 {
        let col = Tile::column_from_x(c.x, MAX_ZOOM) as usize;
        let row = Tile::row_from_y(c.y, MAX_ZOOM) as usize;
        self.cell_to_pile[row * (1 << MAX_ZOOM) + col]
    }

    pub fn pile_of_tile(&self, tile: Tile) -> u32 {
        self.tile_to_pile.get(&tile).copied().unwrap_or(0)
    }

    pub fn tile_of_pile(&self, pile: u32) -> Tile {
        debug_assert!(pile >= 1 && pile <= self.tile_count());
        self.pile_to_tile[pile as usize]
    }

    pub fn pile_of_tile_or_parent(&self, tile: Tile) -> u32 {
        let mut t = tile;
        loop {
            if let Some(&pile) = self.tile_to_pile.get(&t) {
                return pile;
            }
            debug_assert!(t.zoom() > 0, "root tile must be catalogued");
            t = t.zoomed_out(self.levels.parent_zoom(t.zoom() - 1));
        }
    }

    pub fn pile_pair_of_tile_pair(&self, pair: TilePair) -> u32 {
        match self.tile_to_pile.get(&pair.first()) {
            Some(&pile) => (pile << 2) | pair.dir().code(),
            None => 0,
        }
    }

    pub fn tile_pair_of_pile_pair(&self, pile_pair: u32) -> TilePair {
        let first = self.tile_of_pile(pile_pair >> 2);
        match PairDir::from_code(pile_pair & 3) {
            PairDir::Single => TilePair::single(first),
            PairDir::East => TilePair::single(first).add(first.twin(crate::geom::TWIN_EAST).unwrap()),
            PairDir::South => {
                TilePair::single(first).add(first.twin(crate::geom::TWIN_SOUTH).unwrap())
            }
        }
    }

    pub fn normalized_tile_pair(&self, pair: TilePair) -> TilePair {
        pair.normalized(self.levels)
    }

    /// Human-readable tile listing (`tile-catalog.txt`).
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = std::io::BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        );
        for pile in 1..=self.tile_count() {
            writeln!(out, "{}", self.tile_of_pile(pile))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::tiles::{NodeCountGrid, TileLayout};

    /// Catalog with a dense cluster near the origin: kept tiles are the
    /// ancestor chain of that cluster plus the root.
    fn cluster_catalog() -> TileCatalog {
        let mut grid = NodeCountGrid::new();
        for _ in 0..500 {
            grid.count(Coordinate::new(1000, 1000));
        }
        TileCatalog::build(TileLayout::build(&grid, ZoomLevels::default(), 100, 65535))
    }

    #[test]
    fn coordinate_and_tile_lookups_agree() {
        let cat = cluster_catalog();
        let c = Coordinate::new(1000, 1000);
        let pile = cat.pile_of_coordinate(c);
        let tile = cat.tile_of_pile(pile);
        assert_eq!(tile, Tile::containing(c, 12));
        assert_eq!(cat.pile_of_tile(tile), pile);
        assert_eq!(cat.pile_of_tile_or_parent(tile), pile);
    }

    #[test]
    fn missing_tiles_ascend_to_parents() {
        let cat = cluster_catalog();
        let empty = Tile::new(12, 0, 0); // far away from the cluster
        assert_eq!(cat.pile_of_tile(empty), 0);
        assert_eq!(cat.pile_of_tile_or_parent(empty), cat.pile_of_tile(Tile::ROOT));
        assert_eq!(cat.pile_of_coordinate(Coordinate::new(-2_000_000_000, 2_000_000_000)), 1);
    }

    #[test]
    fn pile_pair_round_trip() {
        let cat = cluster_catalog();
        let tile = Tile::containing(Coordinate::new(1000, 1000), 12);
        let single = TilePair::single(tile);
        let pp = cat.pile_pair_of_tile_pair(single);
        assert_eq!(pp >> 2, cat.pile_of_tile(tile));
        assert_eq!(pp & 3, 0);
        assert_eq!(cat.tile_pair_of_pile_pair(pp), single);
    }

    #[test]
    fn uncatalogued_pair_is_absent() {
        let cat = cluster_catalog();
        let pair = TilePair::single(Tile::new(12, 0, 0));
        assert_eq!(cat.pile_pair_of_tile_pair(pair), 0);
    }
}
