//! The four-phase GOL build: analyze, sort, validate, compile.

pub(crate) mod analyze;
pub(crate) mod compile;
pub(crate) mod engine;
pub(crate) mod id_index;
pub(crate) mod pile;
pub(crate) mod progress;
pub(crate) mod proto;
pub mod settings;
pub(crate) mod sort;
pub(crate) mod stats;
pub(crate) mod strings;
pub(crate) mod tiles;
pub(crate) mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use self::id_index::MappedIndex;
use self::pile::PileFile;
use self::progress::{Phase, Progress};
use self::settings::BuildSettings;
use self::stats::{OsmStats, SortStats};
use self::strings::StringCatalog;
use self::tiles::{TileCatalog, TileLayout};
use self::validate::ExportFileReader;
use crate::common::fs::{create_build_dir, with_default_extension};
use crate::common::{CancelFlag, Verbosity};
use crate::osm::{BlockSource, PbfSource};
use crate::store::{GolMetadata, GolWriter};

pub struct BuildSummary {
    pub osm_stats: OsmStats,
    pub sort_stats: SortStats,
    pub tile_count: u32,
    pub global_string_count: usize,
}

pub struct GolBuilder {
    settings: BuildSettings,
    cancel: CancelFlag,
}

impl GolBuilder {
    pub fn new(settings: BuildSettings) -> GolBuilder {
        GolBuilder { settings, cancel: CancelFlag::default() }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Handle for cancelling the build from another thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Build from the configured `.osm.pbf` source.
    pub fn build(&self, gol_path: &Path) -> Result<BuildSummary> {
        let source = self.settings.source.clone();
        self.build_with(|| PbfSource::open(&source), gol_path)
    }

    /// Build from any block source. The source is opened twice: once for
    /// the analyze pass and once for the sort pass.
    pub fn build_with<S, F>(&self, mut open_source: F, gol_path: &Path) -> Result<BuildSummary>
    where
        S: BlockSource,
        F: FnMut() -> Result<S>,
    {
        let settings = &self.settings;
        let verbosity = settings.verbosity;
        let thread_count = effective_thread_count(settings.thread_count);

        let gol_path = with_default_extension(gol_path, "gol");
        let work_dir = sibling_dir(&gol_path, "-work");
        create_build_dir(&work_dir, "work directory")?;
        let index_dir = if settings.keep_indexes {
            let dir = sibling_dir(&gol_path, "-indexes");
            create_build_dir(&dir, "index directory")?;
            dir
        } else {
            work_dir.clone()
        };
        std::fs::write(
            work_dir.join("settings.json"),
            serde_json::to_vec_pretty(settings).expect("settings serialize"),
        )
        .context("Failed to write settings snapshot")?;

        let mut progress = Progress::new(verbosity);

        // Phase 1: analyze
        progress.begin_phase(Phase::Analyze, 0);
        progress.task("Analyzing...");
        let analysis = analyze::analyze(open_source()?, thread_count, settings, &self.cancel)?;
        if verbosity >= Verbosity::Debug {
            analysis.node_counts.save(&work_dir.join("node-counts.bin"))?;
            analysis.strings.save(&work_dir.join("string-counts.bin"))?;
        }

        let mut string_catalog = StringCatalog::default();
        string_catalog.build(
            &analysis.strings,
            &settings.indexed_keys,
            settings.max_strings,
            settings.min_string_usage,
        );
        let layout = TileLayout::build(
            &analysis.node_counts,
            settings.zoom_levels,
            settings.min_tile_density,
            settings.max_tiles,
        );
        let tile_catalog = TileCatalog::build(layout);
        tile_catalog.write(&work_dir.join("tile-catalog.txt"))?;
        let tile_count = tile_catalog.tile_count();
        if verbosity >= Verbosity::Verbose {
            eprintln!("[build] {tile_count} tiles, {} global strings",
                string_catalog.global_count());
        }

        // Prepare scratch: id indexes and the pile file
        // (tile_count + 1 distinct values; pile numbers start at 1)
        let pile_bits = 32 - (tile_count + 1).leading_zeros();
        let indexes = [
            Arc::new(MappedIndex::create(
                &index_dir.join("nodes.idx"),
                analysis.stats.max_node_id.max(0),
                pile_bits,
            )?),
            Arc::new(MappedIndex::create(
                &index_dir.join("ways.idx"),
                analysis.stats.max_way_id.max(0),
                pile_bits + 2,
            )?),
            Arc::new(MappedIndex::create(
                &index_dir.join("relations.idx"),
                analysis.stats.max_relation_id.max(0),
                pile_bits + 2,
            )?),
        ];
        let pile_file =
            PileFile::create(&work_dir.join("features.bin"), tile_count, pile::PAGE_SIZE)?;
        for (pile, &estimate) in tile_catalog.pile_estimates().iter().enumerate().skip(1) {
            pile_file.preallocate(pile as u32, estimate);
        }

        // Phase 2: sort
        let sort_stats = sort::sort(
            open_source()?,
            thread_count,
            &tile_catalog,
            &string_catalog,
            &indexes,
            &pile_file,
            &mut progress,
            analysis.stats.primitive_count(),
            verbosity,
            &self.cancel,
        )?;
        pile_file.sync_directory()?;
        if verbosity >= Verbosity::Verbose {
            // soft property: consumption should stay within 1.5x estimate
            let estimates = tile_catalog.pile_estimates();
            for pile in 1..=tile_count {
                let used = pile_file.bytes_used(pile);
                let estimated = estimates[pile as usize];
                if used > estimated + estimated / 2 {
                    eprintln!(
                        "[build] pile {pile} outgrew its estimate ({used} of {estimated} bytes)"
                    );
                }
            }
        }

        // The indexes are done; release them in the background while the
        // validator runs.
        let keep_indexes = settings.keep_indexes;
        let index_finalizer = std::thread::spawn(move || -> Result<()> {
            for index in indexes {
                if keep_indexes {
                    index.sync()?;
                } else {
                    Arc::into_inner(index)
                        .expect("all index handles released after sort")
                        .clear()?;
                }
            }
            Ok(())
        });

        // Phase 3: validate
        validate::validate(
            thread_count,
            &tile_catalog,
            &pile_file,
            &work_dir,
            &mut progress,
            verbosity,
            &self.cancel,
        )?;
        pile_file.sync_directory()?;

        // Phase 4: compile
        let exports = ExportFileReader::open(&work_dir.join("exports.bin"))?;
        let mut writer = GolWriter::create(&gol_path, tile_count)?;
        compile::compile(
            thread_count,
            &tile_catalog,
            &string_catalog,
            &pile_file,
            &exports,
            settings,
            &mut writer,
            &mut progress,
            &self.cancel,
        )?;
        let meta = GolMetadata {
            guid: rand::random(),
            revision: 0,
            waynode_ids: settings.include_way_node_ids,
            zoom_levels: settings.zoom_levels,
            rtree_branch_size: settings.rtree_branch_size,
            max_key_indexes: settings.max_key_indexes,
            key_index_min_features: settings.key_index_min_features,
        };
        writer.finish(&meta, &string_catalog.serialize_global_table(), &settings.indexed_keys)?;
        progress.finish();

        index_finalizer.join().expect("index finalizer panicked")?;
        if !settings.keep_work && verbosity < Verbosity::Debug {
            drop(exports);
            let _ = std::fs::remove_dir_all(&work_dir);
        }

        Ok(BuildSummary {
            osm_stats: analysis.stats,
            sort_stats,
            tile_count,
            global_string_count: string_catalog.global_count(),
        })
    }
}

fn effective_thread_count(configured: usize) -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if configured == 0 {
        cores
    } else {
        configured.min(cores * 4)
    }
}

/// `planet.gol` -> `planet-work` (next to the output file).
fn sibling_dir(gol_path: &Path, suffix: &str) -> PathBuf {
    let stem = gol_path.file_stem().unwrap_or_default().to_string_lossy();
    gol_path.with_file_name(format!("{stem}{suffix}"))
}
