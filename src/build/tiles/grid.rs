use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};

use crate::geom::{Coordinate, Tile, MAX_ZOOM};

const GRID_EXTENT: usize = 1 << MAX_ZOOM;
// one extra cell counts nodes that fall outside the projected range
const TABLE_SIZE: usize = GRID_EXTENT * GRID_EXTENT + 1;

/// Dense per-cell node counts at zoom 12, the input to the tile layout.
/// Each analyzer worker owns one and the results are summed.
pub struct NodeCountGrid {
    counts: Vec<u32>,
}

impl NodeCountGrid {
    pub fn new() -> Self {
        NodeCountGrid { counts: vec![0; TABLE_SIZE] }
    }

    #[inline]
    pub fn cell_of(c: Coordinate) -> usize {
        let col = Tile::column_from_x(c.x, MAX_ZOOM) as usize;
        let row = Tile::row_from_y(c.y, MAX_ZOOM) as usize;
        row * GRID_EXTENT + col
    }

    #[inline]
    pub fn count(&mut self, c: Coordinate) {
        self.counts[Self::cell_of(c)] += 1;
    }

    pub fn get(&self, col: u32, row: u32) -> u32 {
        self.counts[row as usize * GRID_EXTENT + col as usize]
    }

    /// Total nodes counted; always equals the number of accepted nodes.
    pub fn sum(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    pub fn merge(&mut self, other: &NodeCountGrid) {
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += *b;
        }
    }

    /// Non-zero cells as (leaf tile, count).
    pub fn iter_nonzero(&self) -> impl Iterator<Item = (Tile, u32)> + '_ {
        self.counts[..GRID_EXTENT * GRID_EXTENT]
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(i, &c)| {
                let col = (i % GRID_EXTENT) as u32;
                let row = (i / GRID_EXTENT) as u32;
                (Tile::new(MAX_ZOOM, col, row), c)
            })
    }

    /// Sparse dump of the non-zero cells (debug artifact, reloadable).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GOLN");
        for (tile, count) in self.iter_nonzero() {
            out.extend_from_slice(&pack_tile(tile).to_le_bytes());
            out.extend_from_slice(&count.to_le_bytes());
        }
        fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        ensure!(
            data.len() >= 4 && &data[0..4] == b"GOLN" && (data.len() - 4) % 8 == 0,
            "[tiles] {} is not a node-counts file",
            path.display()
        );
        let mut grid = NodeCountGrid::new();
        for rec in data[4..].chunks_exact(8) {
            let packed = u32::from_le_bytes(rec[0..4].try_into().unwrap());
            let count = u32::from_le_bytes(rec[4..8].try_into().unwrap());
            let (col, row) = unpack_tile(packed);
            grid.counts[row as usize * GRID_EXTENT + col as usize] = count;
        }
        Ok(grid)
    }
}

fn pack_tile(tile: Tile) -> u32 {
    (tile.row() << 12) | tile.column()
}

fn unpack_tile(packed: u32) -> (u32, u32) {
    (packed & 0xfff, (packed >> 12) & 0xfff)
}
