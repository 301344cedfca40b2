use ahash::AHashMap;

use super::NodeCountGrid;
use crate::geom::{Tile, ZoomLevels, MAX_ZOOM};

const GRID_EXTENT: u32 = 1 << MAX_ZOOM;

/// Per-node contribution to a pile's size estimate. Ways and relations ride
/// on top of their nodes, covered by the factor below.
const BYTES_PER_NODE: u64 = 20;
const ESTIMATE_SLACK: u64 = 4096;

/// The chosen tile pyramid: which tiles exist, their pile numbers, and the
/// zoom-12 cell lookup. Deterministic for a given grid and settings.
pub struct TileLayout {
    pub levels: ZoomLevels,
    /// pile (1-based) -> tile; index 0 unused
    pub pile_to_tile: Vec<Tile>,
    pub tile_to_pile: AHashMap<Tile, u32>,
    /// zoom-12 cell -> pile
    pub cell_to_pile: Vec<u32>,
    /// pile (1-based) -> estimated bytes
    pub estimates: Vec<u64>,
}

impl TileLayout {
    /// Build the layout. Tiles below `min_tile_density` collapse into their
    /// parent; if the pyramid still exceeds `max_tiles`, the density
    /// threshold doubles until it fits.
    pub fn build(
        grid: &NodeCountGrid,
        levels: ZoomLevels,
        min_tile_density: u64,
        max_tiles: usize,
    ) -> TileLayout {
        // Aggregate sparse counts per catalogued level
        let mut per_level: Vec<AHashMap<Tile, u64>> = Vec::new();
        let catalogued: Vec<u32> = levels.iter().collect();
        let leaf = levels.leaf_zoom();
        let mut leaf_counts: AHashMap<Tile, u64> = AHashMap::new();
        for (tile, count) in grid.iter_nonzero() {
            *leaf_counts.entry(tile.zoomed_out(leaf)).or_default() += count as u64;
        }
        per_level.push(leaf_counts);
        for window in catalogued.windows(2).rev() {
            let coarser = window[0];
            let finer = per_level.last().unwrap();
            let mut counts: AHashMap<Tile, u64> = AHashMap::with_capacity(finer.len() / 2);
            for (&tile, &count) in finer {
                *counts.entry(tile.zoomed_out(coarser)).or_default() += count;
            }
            per_level.push(counts);
        }
        per_level.reverse(); // now indexed coarse -> fine, matching `catalogued`

        let mut density = min_tile_density.max(1);
        let kept: Vec<Tile> = loop {
            let mut kept = vec![Tile::ROOT];
            for (level_idx, &zoom) in catalogued.iter().enumerate() {
                if zoom == 0 {
                    continue;
                }
                for (&tile, &count) in &per_level[level_idx] {
                    if count >= density {
                        kept.push(tile);
                    }
                }
            }
            if kept.len() <= max_tiles.max(1) {
                break kept;
            }
            density *= 2;
        };

        // Number piles by zoom, then Hilbert position within the zoom
        let mut ordered = kept;
        ordered.sort_by_key(|t| (t.zoom(), t.hilbert_index()));
        let mut pile_to_tile = Vec::with_capacity(ordered.len() + 1);
        pile_to_tile.push(Tile::ROOT); // dummy slot, pile 0 = absent
        let mut tile_to_pile = AHashMap::with_capacity(ordered.len());
        for (i, &tile) in ordered.iter().enumerate() {
            pile_to_tile.push(tile);
            tile_to_pile.insert(tile, i as u32 + 1);
        }

        // Paint the cell lookup coarse-to-fine so deeper tiles win
        let mut cell_to_pile = vec![0u32; (GRID_EXTENT * GRID_EXTENT) as usize];
        for (pile0, &tile) in ordered.iter().enumerate() {
            let shift = MAX_ZOOM - tile.zoom();
            let col0 = tile.column() << shift;
            let row0 = tile.row() << shift;
            let extent = 1u32 << shift;
            for row in row0..row0 + extent {
                let base = (row * GRID_EXTENT + col0) as usize;
                cell_to_pile[base..base + extent as usize].fill(pile0 as u32 + 1);
            }
        }

        // Size estimates: each tile keeps the nodes not claimed by a kept
        // descendant; scale by an empirical per-node cost.
        let mut residual = vec![0u64; ordered.len() + 1];
        for (&tile, &pile) in &tile_to_pile {
            let level_idx = catalogued.iter().position(|&z| z == tile.zoom()).unwrap();
            residual[pile as usize] = if tile.zoom() == 0 {
                per_level[0].values().sum()
            } else {
                per_level[level_idx][&tile]
            };
        }
        let aggregate = residual.clone();
        for (&tile, &pile) in &tile_to_pile {
            if tile.zoom() == 0 {
                continue;
            }
            let parent = nearest_kept_ancestor(tile, levels, &tile_to_pile);
            residual[parent as usize] =
                residual[parent as usize].saturating_sub(aggregate[pile as usize]);
        }
        let estimates = residual
            .iter()
            .map(|&nodes| nodes * BYTES_PER_NODE + ESTIMATE_SLACK)
            .collect();

        TileLayout { levels, pile_to_tile, tile_to_pile, cell_to_pile, estimates }
    }
}

fn nearest_kept_ancestor(tile: Tile, levels: ZoomLevels, kept: &AHashMap<Tile, u32>) -> u32 {
    let mut t = tile;
    loop {
        debug_assert!(t.zoom() > 0);
        t = t.zoomed_out(levels.parent_zoom(t.zoom() - 1));
        if let Some(&pile) = kept.get(&t) {
            return pile;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Coordinate;

    fn grid_with_cluster(n: u32) -> NodeCountGrid {
        let mut grid = NodeCountGrid::new();
        for _ in 0..n {
            grid.count(Coordinate::new(1000, 1000));
        }
        grid
    }

    #[test]
    fn sparse_grid_collapses_to_root() {
        let grid = grid_with_cluster(10);
        let layout = TileLayout::build(&grid, ZoomLevels::default(), 100, 65535);
        assert_eq!(layout.pile_to_tile.len(), 2); // dummy + root
        assert_eq!(layout.pile_to_tile[1], Tile::ROOT);
        // every cell resolves to the root pile
        assert!(layout.cell_to_pile.iter().all(|&p| p == 1));
    }

    #[test]
    fn dense_cluster_keeps_the_subtree() {
        let grid = grid_with_cluster(500);
        let layout = TileLayout::build(&grid, ZoomLevels::default(), 100, 65535);
        // the cluster's ancestor chain at 2/4/6/8/10/12 is kept, plus root
        assert_eq!(layout.pile_to_tile.len(), 8);
        let cell = NodeCountGrid::cell_of(Coordinate::new(1000, 1000));
        let leaf_pile = layout.cell_to_pile[cell];
        assert_eq!(layout.pile_to_tile[leaf_pile as usize].zoom(), 12);
        // a far-away cell falls back to the root
        let far = NodeCountGrid::cell_of(Coordinate::new(-1_000_000_000, 0));
        assert_eq!(layout.cell_to_pile[far as usize], layout.tile_to_pile[&Tile::ROOT]);
    }

    #[test]
    fn max_tiles_doubles_density_until_it_fits() {
        let mut grid = NodeCountGrid::new();
        // four clusters in different quadrants: 200 nodes each
        for (x, y) in [(1, 1), (-2, 1), (1, -2), (-2, -2)] {
            for _ in 0..200 {
                grid.count(Coordinate::new(x * 1_000_000_000, y * 1_000_000_000));
            }
        }
        let unbounded = TileLayout::build(&grid, ZoomLevels::default(), 100, 65535);
        assert_eq!(unbounded.pile_to_tile.len(), 1 + 1 + 4 * 6);
        let bounded = TileLayout::build(&grid, ZoomLevels::default(), 100, 10);
        // density doubling past 200 collapses everything into the root
        assert_eq!(bounded.pile_to_tile.len(), 2);
    }

    #[test]
    fn piles_are_numbered_by_zoom_then_hilbert() {
        let mut grid = NodeCountGrid::new();
        for (x, y) in [(1, 1), (-2, 1), (1, -2), (-2, -2)] {
            for _ in 0..200 {
                grid.count(Coordinate::new(x * 1_000_000_000, y * 1_000_000_000));
            }
        }
        let layout = TileLayout::build(&grid, ZoomLevels::default(), 100, 65535);
        let tiles = &layout.pile_to_tile[1..];
        for pair in tiles.windows(2) {
            assert!(
                (pair[0].zoom(), pair[0].hilbert_index())
                    < (pair[1].zoom(), pair[1].hilbert_index())
            );
        }
    }

    #[test]
    fn estimates_cover_resident_nodes() {
        let grid = grid_with_cluster(500);
        let layout = TileLayout::build(&grid, ZoomLevels::default(), 100, 65535);
        // all nodes live in the leaf tile; its estimate must cover them
        let cell = NodeCountGrid::cell_of(Coordinate::new(1000, 1000));
        let leaf_pile = layout.cell_to_pile[cell] as usize;
        assert!(layout.estimates[leaf_pile] >= 500 * BYTES_PER_NODE);
        // ancestors hold no residual nodes, just slack
        assert_eq!(layout.estimates[1], ESTIMATE_SLACK);
    }
}
