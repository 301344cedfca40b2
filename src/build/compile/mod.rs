//! Phase 4: compile each tile's pile into its final binary form and hand
//! the blob to the GOL store.

pub mod area;
pub(crate) mod layout;
mod model;
mod spatial;

use ahash::AHashMap;
use anyhow::Result;

use self::area::{AreaClassifier, TagStr};
use self::layout::{serialize_tile, TileIndexes, AREA_RELATION_BIT};
use self::model::{build_model, parent_marker_parts, CompModel, TagKey, TagList, TagValue};
use self::spatial::{build_index, SpatialItem};
use crate::build::engine::process_batches;
use crate::build::pile::PileFile;
use crate::build::progress::{Phase, Progress};
use crate::build::settings::BuildSettings;
use crate::build::strings::StringCatalog;
use crate::build::tiles::TileCatalog;
use crate::build::validate::ExportFileReader;
use crate::common::{CancelFlag, Verbosity};
use crate::geom::Tile;
use crate::store::GolWriter;

/// Run the compile pass, registering every tile blob with the store.
#[allow(clippy::too_many_arguments)]
pub fn compile(
    thread_count: usize,
    tiles: &TileCatalog,
    strings: &StringCatalog,
    piles: &PileFile,
    exports: &ExportFileReader,
    settings: &BuildSettings,
    writer: &mut GolWriter,
    progress: &mut Progress,
    cancel: &CancelFlag,
) -> Result<()> {
    let tile_count = tiles.tile_count();
    progress.begin_phase(Phase::Compile, tile_count as u64);
    progress.task("Compiling...");

    let classifier = AreaClassifier::compile(&settings.area_rules, |s| strings.global_code_of(s));
    // indexed keys occupy GST codes right after the core strings, in order
    let mut key_categories: AHashMap<u16, u32> = AHashMap::new();
    for key in &settings.indexed_keys {
        if let Some(code) = strings.global_code_of(&key.key) {
            key_categories.insert(code, key.category);
        }
    }

    let shared = CompileShared {
        tiles,
        strings,
        piles,
        exports,
        classifier,
        key_categories,
        branch_size: settings.rtree_branch_size,
        max_key_indexes: settings.max_key_indexes,
        key_index_min_features: settings.key_index_min_features,
        include_waynode_ids: settings.include_way_node_ids,
        verbosity: settings.verbosity,
    };

    let batch: Vec<(u32, Tile)> =
        (1..=tile_count).map(|pile| (pile, tiles.tile_of_pile(pile))).collect();
    let contexts: Vec<&CompileShared> = (0..thread_count).map(|_| &shared).collect();

    process_batches(
        vec![batch],
        contexts,
        |shared, (pile, tile)| shared.compile_tile(pile, tile),
        |(pile, blob, raw_len): (u32, Vec<u8>, u32)| {
            writer.add_tile(pile, &blob, raw_len)?;
            progress.advance(1);
            Ok(())
        },
        cancel,
    )
}

struct CompileShared<'a> {
    tiles: &'a TileCatalog,
    strings: &'a StringCatalog,
    piles: &'a PileFile,
    exports: &'a ExportFileReader,
    classifier: AreaClassifier,
    key_categories: AHashMap<u16, u32>,
    branch_size: u32,
    max_key_indexes: u32,
    key_index_min_features: u32,
    include_waynode_ids: bool,
    verbosity: Verbosity,
}

impl CompileShared<'_> {
    fn compile_tile(&self, pile: u32, tile: Tile) -> Result<(u32, Vec<u8>, u32)> {
        let data = self.piles.load(pile)?;
        let mut model = build_model(&data, self.strings);
        self.classify_areas(&mut model);
        self.resolve_parent_markers(&mut model, tile);
        add_orphan_tags(&mut model);

        let indexes = self.build_indexes(&model, tile);
        let blob = serialize_tile(&model, &indexes, self.include_waynode_ids, |pile, rel_id| {
            let tex = self.exports.tex_of_relation(pile, rel_id);
            if tex.is_none() && self.verbosity >= Verbosity::Debug {
                eprintln!("[compile] relation/{rel_id} not exported by pile {pile}");
            }
            tex
        });
        let raw_len = blob.len() as u32;
        let compressed = crate::store::compress_blob(&blob)?;
        Ok((pile, compressed, raw_len))
    }

    fn classify_areas(&self, model: &mut CompModel) {
        for wi in 0..model.ways.len() {
            if !model.ways[wi].closed_ring {
                continue;
            }
            let flags = self.classifier.classify(tag_strs(&model.ways[wi].tags, model));
            model.ways[wi].is_area = flags.way;
        }
        for ri in 0..model.relations.len() {
            let flags = self.classifier.classify(tag_strs(&model.relations[ri].tags, model));
            model.relations[ri].is_area = flags.relation;
        }
    }

    /// Turn relative parent markers into actual pile numbers.
    fn resolve_parent_markers(&self, model: &mut CompModel, tile: Tile) {
        let resolve = |marker: u32| -> u32 {
            let (zoom_delta, _twin) = parent_marker_parts(marker);
            let parent = tile.zoomed_out(tile.zoom() - zoom_delta.min(tile.zoom()));
            self.tiles.pile_of_tile(parent)
        };
        for n in &mut model.nodes {
            for p in &mut n.parents {
                p.pile = resolve(p.pile);
            }
        }
        for w in &mut model.ways {
            for p in &mut w.parents {
                p.pile = resolve(p.pile);
            }
        }
        for r in &mut model.relations {
            for p in &mut r.parents {
                p.pile = resolve(p.pile);
            }
        }
    }

    fn key_bits(&self, tags: &TagList) -> u32 {
        let mut bits = 0;
        for &(k, _) in tags {
            if let TagKey::Global(code) = k {
                if let Some(&cat) = self.key_categories.get(&code) {
                    bits |= 1 << (cat - 1);
                }
            }
        }
        bits
    }

    fn build_indexes(&self, model: &CompModel, tile: Tile) -> TileIndexes {
        let mut node_items = Vec::new();
        for (i, node) in model.nodes.iter().enumerate() {
            if !node.is_feature {
                continue;
            }
            let mut bounds = crate::geom::Bbox::empty();
            bounds.expand_to_include(node.xy);
            node_items.push(SpatialItem {
                slot: i as u32,
                hilbert: tile.hilbert_within(node.xy),
                bounds,
                key_bits: self.key_bits(&node.tags),
            });
        }
        let mut way_items = Vec::new();
        let mut area_items = Vec::new();
        for (i, way) in model.ways.iter().enumerate() {
            let item = SpatialItem {
                slot: i as u32,
                hilbert: hilbert_of_bounds(tile, &way.bounds),
                bounds: way.bounds,
                key_bits: self.key_bits(&way.tags),
            };
            if way.is_area {
                area_items.push(item);
            } else {
                way_items.push(item);
            }
        }
        let mut relation_items = Vec::new();
        for (i, rel) in model.relations.iter().enumerate() {
            let mut item = SpatialItem {
                slot: i as u32,
                hilbert: hilbert_of_bounds(tile, &rel.bounds),
                bounds: rel.bounds,
                key_bits: self.key_bits(&rel.tags),
            };
            if rel.is_area {
                item.slot |= AREA_RELATION_BIT;
                area_items.push(item);
            } else {
                relation_items.push(item);
            }
        }
        let build = |items| {
            build_index(items, self.branch_size, self.max_key_indexes, self.key_index_min_features)
        };
        TileIndexes {
            nodes: build(node_items),
            ways: build(way_items),
            areas: build(area_items),
            relations: build(relation_items),
        }
    }
}

fn hilbert_of_bounds(tile: Tile, bounds: &crate::geom::Bbox) -> u32 {
    if bounds.is_empty() {
        return 0;
    }
    tile.hilbert_within(bounds.center())
}

fn tag_strs<'a>(
    tags: &'a TagList,
    model: &'a CompModel,
) -> impl Iterator<Item = (TagStr<'a>, TagStr<'a>)> {
    tags.iter().map(move |&(k, v)| {
        let key = match k {
            TagKey::Global(code) => TagStr::Global(code),
            TagKey::Local(i) => TagStr::Local(&model.local_strings[i as usize]),
        };
        let value = match v {
            TagValue::Global(code) => TagStr::Global(code),
            TagValue::Local(i) => TagStr::Local(&model.local_strings[i as usize]),
            TagValue::Narrow(_) => TagStr::Number,
        };
        (key, value)
    })
}

/// Orphan nodes keep their feature status through a synthetic tag.
fn add_orphan_tags(model: &mut CompModel) {
    let mut orphan_key = None;
    for ni in 0..model.nodes.len() {
        if !model.nodes[ni].orphan {
            continue;
        }
        let key =
            *orphan_key.get_or_insert_with(|| TagKey::Local(model.intern("geodesk:orphan")));
        // "yes" is core global string 2
        model.nodes[ni].tags.push((key, TagValue::Global(2)));
    }
}
