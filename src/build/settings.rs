use std::path::PathBuf;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use super::compile::area::{parse_area_rules, AreaRule, DEFAULT_AREA_RULES};
use crate::common::Verbosity;
use crate::geom::ZoomLevels;

pub const MAX_INDEXED_KEYS: usize = 32;
pub const MAX_INDEX_CATEGORIES: u32 = 30;

pub const DEFAULT_INDEXED_KEYS: &str = "\
    place highway railway aeroway aerialway tourism amenity shop craft \
    power industrial man_made leisure landuse waterway natural/geological \
    military historic healthcare office emergency building boundary \
    building:part telecom communication route";

/// A key whose features get their own spatial sub-index, grouped into
/// categories (keys joined with `/` share one).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct IndexedKey {
    pub key: String,
    pub category: u32,
}

/// All build options, validated. A snapshot is saved into the work
/// directory so resumed phases run with identical settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildSettings {
    pub source: PathBuf,
    pub zoom_levels: ZoomLevels,
    pub max_tiles: usize,
    pub min_tile_density: u64,
    pub max_strings: usize,
    pub min_string_usage: u64,
    pub rtree_branch_size: u32,
    pub max_key_indexes: u32,
    pub key_index_min_features: u32,
    pub indexed_keys: Vec<IndexedKey>,
    pub area_rules: Vec<AreaRule>,
    pub include_way_node_ids: bool,
    pub keep_indexes: bool,
    pub keep_work: bool,
    pub thread_count: usize,
    #[serde(skip)]
    pub verbosity: Verbosity,
}

impl Default for BuildSettings {
    fn default() -> Self {
        BuildSettings {
            source: PathBuf::new(),
            zoom_levels: ZoomLevels::default(),
            max_tiles: 65535,
            min_tile_density: 75_000,
            max_strings: 32_000,
            min_string_usage: 300,
            rtree_branch_size: 16,
            max_key_indexes: 8,
            key_index_min_features: 300,
            indexed_keys: Vec::new(),
            area_rules: Vec::new(),
            include_way_node_ids: false,
            keep_indexes: false,
            keep_work: false,
            thread_count: 0,
            verbosity: Verbosity::default(),
        }
    }
}

impl BuildSettings {
    pub fn set_levels(&mut self, s: &str) -> Result<()> {
        self.zoom_levels = parse_zoom_levels(s)?;
        Ok(())
    }

    pub fn set_max_tiles(&mut self, v: i64) -> Result<()> {
        ensure!(v >= 1 && v <= 8_000_000, "max-tiles must be 1 to 8000000");
        self.max_tiles = v as usize;
        Ok(())
    }

    pub fn set_min_tile_density(&mut self, v: i64) -> Result<()> {
        ensure!(v >= 1 && v <= 10_000_000, "min-tile-density must be 1 to 10000000");
        self.min_tile_density = v as u64;
        Ok(())
    }

    pub fn set_max_strings(&mut self, v: i64) -> Result<()> {
        ensure!(v >= 256 && v <= 65_533, "max-strings must be 256 to 65533");
        self.max_strings = v as usize;
        Ok(())
    }

    pub fn set_min_string_usage(&mut self, v: i64) -> Result<()> {
        ensure!(v >= 1 && v <= 100_000_000, "min-string-usage must be 1 to 100000000");
        self.min_string_usage = v as u64;
        Ok(())
    }

    pub fn set_rtree_branch_size(&mut self, v: i64) -> Result<()> {
        ensure!(v >= 4 && v <= 255, "rtree-branch-size must be 4 to 255");
        self.rtree_branch_size = v as u32;
        Ok(())
    }

    pub fn set_max_key_indexes(&mut self, v: i64) -> Result<()> {
        ensure!(v >= 0 && v as u32 <= MAX_INDEX_CATEGORIES, "max-key-indexes must be 0 to 30");
        self.max_key_indexes = v as u32;
        Ok(())
    }

    pub fn set_key_index_min_features(&mut self, v: i64) -> Result<()> {
        ensure!(v >= 1 && v <= 1_000_000, "key-index-min-features must be 1 to 1000000");
        self.key_index_min_features = v as u32;
        Ok(())
    }

    pub fn set_indexed_keys(&mut self, s: &str) -> Result<()> {
        self.indexed_keys = parse_indexed_keys(s)?;
        Ok(())
    }

    pub fn set_area_rules(&mut self, s: &str) -> Result<()> {
        self.area_rules = parse_area_rules(s)?;
        Ok(())
    }

    /// Enable incremental updates: keeps the id indexes and implies
    /// way-node ids.
    pub fn set_updatable(&mut self) {
        self.keep_indexes = true;
        self.include_way_node_ids = true;
    }

    /// Fill in defaults for anything not explicitly configured.
    pub fn complete(&mut self) -> Result<()> {
        if self.area_rules.is_empty() {
            self.area_rules = parse_area_rules(DEFAULT_AREA_RULES)?;
        }
        if self.indexed_keys.is_empty() {
            self.indexed_keys = parse_indexed_keys(DEFAULT_INDEXED_KEYS)?;
        }
        Ok(())
    }
}

/// Zoom levels as `0/2/4/6/8/10/12` (commas also accepted).
pub fn parse_zoom_levels(s: &str) -> Result<ZoomLevels> {
    let mut levels = Vec::new();
    for part in s.split(['/', ',']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let level: u32 = part
            .parse()
            .map_err(|_| anyhow::anyhow!("Expected zoom level (0 to 12), got '{part}'"))?;
        levels.push(level);
    }
    ensure!(!levels.is_empty(), "Expected at least one zoom level");
    ZoomLevels::from_levels(&levels)
}

/// Indexed keys, whitespace- or comma-separated; `a/b` puts `b` in the
/// same category as `a`. Categories are 1-based.
pub fn parse_indexed_keys(s: &str) -> Result<Vec<IndexedKey>> {
    let mut keys = Vec::new();
    let mut category = 0u32;
    for group in s.split([' ', ',', '\t', '\n']).filter(|g| !g.is_empty()) {
        category += 1;
        ensure!(
            category <= MAX_INDEX_CATEGORIES,
            "Too many index categories (maximum {MAX_INDEX_CATEGORIES})"
        );
        for key in group.split('/').filter(|k| !k.is_empty()) {
            ensure!(keys.len() < MAX_INDEXED_KEYS, "Too many keys (maximum {MAX_INDEXED_KEYS})");
            ensure!(
                !keys.iter().any(|k: &IndexedKey| k.key == key),
                "Duplicate key: {key}"
            );
            keys.push(IndexedKey { key: key.to_string(), category });
        }
    }
    Ok(keys)
}
