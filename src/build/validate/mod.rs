//! Phase 3: per-tile reconciliation. Each tile's pile is materialized into
//! an in-memory model; relations are walked (parents first) to compute
//! exported bounding boxes, nodes are checked for shared locations, and
//! everything referenced across tile boundaries is exported into the
//! neighboring piles together with a per-tile export table.
//!
//! Tiles run deepest zoom first, and within a zoom in two passes colored
//! by `(column ^ row) & 1`, so a tile's pile is never appended to while
//! any worker might be reading it: exports only ever target parent tiles
//! (later batches) or the opposite color.

mod exports;

pub use exports::{ExportFileReader, ExportFileWriter};

use std::path::Path;

use ahash::AHashMap;
use anyhow::Result;

use crate::build::engine::process_batches;
use crate::build::pile::PileFile;
use crate::build::progress::{Phase, Progress};
use crate::build::proto::{
    read_tile, skip_proto_string, Locator, PileTray, TileSink, SPECIAL_ORPHAN, SPECIAL_SHARED,
};
use crate::build::tiles::TileCatalog;
use crate::common::varint::Cursor;
use crate::common::{CancelFlag, Verbosity};
use crate::feature::{FeatureType, TypedFeatureId};
use crate::geom::{Bbox, Coordinate, Tile};

const FLAG_TAGGED: u8 = 1;
const FLAG_SHARES_LOCATION: u8 = 2;
const FLAG_WAY_NODE: u8 = 4;
const FLAG_RELATION_NODE: u8 = 8;

/// Run the validate pass over all tiles.
pub fn validate(
    thread_count: usize,
    tiles: &TileCatalog,
    piles: &PileFile,
    work_dir: &Path,
    progress: &mut Progress,
    verbosity: Verbosity,
    cancel: &CancelFlag,
) -> Result<()> {
    let tile_count = tiles.tile_count();
    progress.begin_phase(Phase::Validate, tile_count as u64);
    progress.task("Validating...");

    let mut exports_writer = ExportFileWriter::create(&work_dir.join("exports.bin"), tile_count)?;

    let mut tasks: Vec<(u32, Tile)> =
        (1..=tile_count).map(|pile| (pile, tiles.tile_of_pile(pile))).collect();
    tasks.sort_by_key(|&(pile, tile)| batch_key(tile) << 32 | pile as u64);
    let mut batches: Vec<Vec<(u32, Tile)>> = Vec::new();
    let mut prev_key = u64::MAX;
    for task in tasks {
        let key = batch_key(task.1);
        if key != prev_key {
            batches.push(Vec::new());
            prev_key = key;
        }
        batches.last_mut().unwrap().push(task);
    }

    let contexts: Vec<ValidatorWorker> =
        (0..thread_count).map(|_| ValidatorWorker::new(tiles, piles, verbosity)).collect();

    process_batches(
        batches,
        contexts,
        |worker, (pile, tile)| worker.process(pile, tile),
        |out: ValidatorOutput| {
            for (pile, data) in &out.batches {
                piles.append(*pile, data)?;
            }
            exports_writer.write(out.pile, &out.foreign_relations)?;
            progress.advance(1);
            Ok(())
        },
        cancel,
    )?;
    exports_writer.close()
}

/// Deeper zooms first, even tiles before odd within a zoom.
fn batch_key(tile: Tile) -> u64 {
    (((15 - tile.zoom()) as u64) << 1) | tile.is_odd() as u64
}

struct ValidatorOutput {
    pile: u32,
    batches: Vec<(u32, Vec<u8>)>,
    /// (relation id, tex), sorted by id
    foreign_relations: Vec<(u64, u32)>,
}

// ---------------------------------------------------------------------
// In-memory tile model

struct VNode {
    id: u64,
    xy: Coordinate,
    flags: u8,
    /// relative-tile export bitmap (see `locator_exports`)
    tiles: u64,
    tex: i32,
}

impl VNode {
    fn is_feature(&self) -> bool {
        self.flags & (FLAG_TAGGED | FLAG_SHARES_LOCATION | FLAG_RELATION_NODE) != 0
    }

    fn is_orphan(&self) -> bool {
        self.flags & (FLAG_TAGGED | FLAG_WAY_NODE | FLAG_RELATION_NODE) == 0
    }
}

struct VFeature {
    id: u64,
    body: (u32, u32),
    twin_code: u32,
    export_always: bool,
    processed: bool,
    /// whether bounds are being computed (the feature is exported)
    tracked: bool,
    tiles: u64,
    bounds: Bbox,
    tex: i32,
}

#[derive(Copy, Clone)]
enum Slot {
    LocalNode(u32),
    Way(u32),
    Relation(u32),
    ForeignNode(u32),
    Foreign2D(u32),
}

#[derive(Default)]
struct TileModel {
    nodes: Vec<VNode>,
    ways: Vec<VFeature>,
    relations: Vec<VFeature>,
    foreign_nodes: Vec<(u64, Coordinate)>,
    foreign: Vec<Bbox>,
    index: AHashMap<u64, Slot>,
}

impl TileModel {
    fn clear(&mut self) {
        self.nodes.clear();
        self.ways.clear();
        self.relations.clear();
        self.foreign_nodes.clear();
        self.foreign.clear();
        self.index.clear();
    }
}

/// Export bits of a locator: the ancestor tile at the locator's zoom
/// delta, plus its twin if one is named.
fn locator_exports(locator: Locator) -> u64 {
    let base = locator.zoom_delta() * 5;
    (1 << base) | (1 << (base + locator.twin_code()))
}

/// Export bit for a feature's own-level twin, if any.
fn twin_exports(twin_code: u32) -> u64 {
    if twin_code != 0 {
        1 << twin_code
    } else {
        0
    }
}

struct ModelBuilder<'a> {
    data: &'a [u8],
    model: &'a mut TileModel,
    tile: Tile,
}

impl ModelBuilder<'_> {
    fn body_range(&self, body: &[u8]) -> (u32, u32) {
        let ofs = body.as_ptr() as usize - self.data.as_ptr() as usize;
        (ofs as u32, body.len() as u32)
    }
}

impl TileSink for ModelBuilder<'_> {
    fn node(&mut self, id: u64, xy: Coordinate, tags: &[u8]) {
        debug_assert!(self.tile.bounds().contains(xy), "node/{id} outside {}", self.tile);
        let idx = self.model.nodes.len() as u32;
        self.model.nodes.push(VNode {
            id,
            xy,
            flags: if tags.is_empty() { 0 } else { FLAG_TAGGED },
            tiles: 0,
            tex: -1,
        });
        self.model.index.insert(TypedFeatureId::of_node(id).raw(), Slot::LocalNode(idx));
    }

    fn way(&mut self, id: u64, locator: Locator, body: &[u8]) {
        if locator.zoom_delta() > 0 {
            // ghost way: only marks its local nodes for export
            let node_tiles = locator_exports(locator);
            let mut c = Cursor::new(body);
            let count = c.read_varint() >> 1;
            let mut node_id = 0i64;
            for _ in 0..count {
                node_id += c.read_signed_varint();
                if let Some(Slot::LocalNode(i)) =
                    self.model.index.get(&TypedFeatureId::of_node(node_id as u64).raw())
                {
                    let node = &mut self.model.nodes[*i as usize];
                    node.tiles |= node_tiles;
                    node.flags |= FLAG_WAY_NODE;
                }
            }
            return;
        }
        let idx = self.model.ways.len() as u32;
        self.model.ways.push(VFeature {
            id,
            body: self.body_range(body),
            twin_code: locator.twin_code(),
            export_always: false,
            processed: false,
            tracked: false,
            tiles: 0,
            bounds: Bbox::empty(),
            tex: -1,
        });
        self.model.index.insert(TypedFeatureId::of_way(id).raw(), Slot::Way(idx));
    }

    fn relation(&mut self, id: u64, locator: Locator, body: &[u8]) {
        let idx = self.model.relations.len() as u32;
        self.model.relations.push(VFeature {
            id,
            body: self.body_range(body),
            twin_code: locator.twin_code(),
            // a zoom delta of 1 flags a relation with deeper members
            export_always: locator.zoom_delta() > 0,
            processed: false,
            tracked: false,
            tiles: 0,
            bounds: Bbox::empty(),
            tex: -1,
        });
        self.model.index.insert(TypedFeatureId::of_relation(id).raw(), Slot::Relation(idx));
    }

    fn membership(&mut self, _rel_id: u64, locator: Locator, member: TypedFeatureId) {
        let tiles = locator_exports(locator);
        match self.model.index.get(&member.raw()).copied() {
            Some(Slot::LocalNode(i)) => {
                let node = &mut self.model.nodes[i as usize];
                node.tiles |= tiles;
                node.flags |= FLAG_RELATION_NODE;
            }
            Some(Slot::Way(i)) => self.model.ways[i as usize].tiles |= tiles,
            Some(Slot::Relation(i)) => self.model.relations[i as usize].tiles |= tiles,
            _ => {
                // the member was rejected upstream
                debug_assert!(false, "membership for unknown {member}");
            }
        }
    }

    fn foreign_node(&mut self, _source_pile: u32, id: u64, xy: Coordinate, _tex: Option<u32>) {
        let idx = self.model.foreign_nodes.len() as u32;
        self.model.foreign_nodes.push((id, xy));
        self.model
            .index
            .insert(TypedFeatureId::of_node(id).raw(), Slot::ForeignNode(idx));
    }

    fn foreign_feature(
        &mut self,
        _source_pile: u32,
        ftype: FeatureType,
        id: u64,
        bounds: Bbox,
        _tex: u32,
    ) {
        if bounds.is_empty() {
            return;
        }
        let idx = self.model.foreign.len() as u32;
        self.model.foreign.push(bounds);
        self.model
            .index
            .insert(TypedFeatureId::new(ftype, id).raw(), Slot::Foreign2D(idx));
    }
}

// ---------------------------------------------------------------------
// Worker

#[derive(Copy, Clone)]
enum ExportRef {
    Node(u32),
    Way(u32),
    Relation(u32),
}

pub(crate) struct ValidatorWorker<'a> {
    tiles: &'a TileCatalog,
    piles: &'a PileFile,
    verbosity: Verbosity,
    model: TileModel,
    tray: PileTray,
    exports: Vec<(u32, ExportRef)>,
    current_tile: Tile,
    current_pile: u32,
}

impl<'a> ValidatorWorker<'a> {
    fn new(tiles: &'a TileCatalog, piles: &'a PileFile, verbosity: Verbosity) -> Self {
        ValidatorWorker {
            tiles,
            piles,
            verbosity,
            model: TileModel::default(),
            tray: PileTray::default(),
            exports: Vec::new(),
            current_tile: Tile::ROOT,
            current_pile: 0,
        }
    }

    fn process(&mut self, pile: u32, tile: Tile) -> Result<ValidatorOutput> {
        let data = self.piles.load(pile)?;
        self.model.clear();
        self.exports.clear();
        self.current_tile = tile;
        self.current_pile = pile;
        read_tile(&data, &mut ModelBuilder { data: &data, model: &mut self.model, tile });

        self.process_relations(&data);
        self.process_ways(&data);
        self.process_nodes();
        let foreign_relations = self.build_export_table();
        self.export_nodes();
        self.export_features(false);
        self.export_features(true);

        Ok(ValidatorOutput { pile, batches: self.tray.drain(), foreign_relations })
    }

    /// Parents precede children in reverse record order, so every child's
    /// export bits are known before its own turn.
    fn process_relations(&mut self, data: &[u8]) {
        for ri in (0..self.model.relations.len()).rev() {
            if !self.model.relations[ri].processed {
                let rel = &mut self.model.relations[ri];
                rel.tracked = rel.tiles != 0 || rel.export_always;
                self.process_relation(ri, data);
            }
            let rel = &self.model.relations[ri];
            let (export, bounds) =
                ((rel.tracked && rel.tiles != 0) || rel.export_always, rel.bounds);
            if export {
                let h = self.hilbert_of(&bounds);
                self.exports.push((h, ExportRef::Relation(ri as u32)));
            }
        }
    }

    fn process_relation(&mut self, ri: usize, data: &[u8]) {
        let rel = &self.model.relations[ri];
        let member_exports = twin_exports(rel.twin_code);
        let track = rel.tracked;
        let (ofs, len) = rel.body;
        let mut bounds = rel.bounds;
        let mut c = Cursor::new(&data[ofs as usize..(ofs + len) as usize]);
        let member_count = c.read_varint();
        for _ in 0..member_count {
            let typed = c.read_varint();
            skip_proto_string(&mut c);
            if typed == 0 {
                continue; // cleared member
            }
            let Some(slot) = self.model.index.get(&typed).copied() else {
                continue; // lives in another tile and is not exported here
            };
            match slot {
                Slot::LocalNode(i) => {
                    let node = &mut self.model.nodes[i as usize];
                    node.tiles |= member_exports;
                    node.flags |= FLAG_RELATION_NODE;
                    if track {
                        bounds.expand_to_include(node.xy);
                    }
                }
                Slot::ForeignNode(i) => {
                    if track {
                        bounds.expand_to_include(self.model.foreign_nodes[i as usize].1);
                    }
                }
                Slot::Foreign2D(i) => {
                    if track {
                        bounds.expand_to_include_box(&self.model.foreign[i as usize]);
                    }
                }
                Slot::Way(i) => {
                    if track || member_exports != 0 {
                        if !self.model.ways[i as usize].processed {
                            self.model.ways[i as usize].tracked = true;
                            self.process_way(i as usize, data);
                        }
                        let way = &mut self.model.ways[i as usize];
                        way.tiles |= member_exports;
                        if track {
                            bounds.expand_to_include_box(&way.bounds);
                        }
                    }
                }
                Slot::Relation(i) => {
                    if track || member_exports != 0 {
                        if !self.model.relations[i as usize].processed {
                            self.model.relations[i as usize].tracked = true;
                            self.process_relation(i as usize, data);
                        }
                        let child = &mut self.model.relations[i as usize];
                        child.tiles |= member_exports;
                        if track {
                            bounds.expand_to_include_box(&child.bounds);
                        }
                    }
                }
            }
        }
        let rel = &mut self.model.relations[ri];
        rel.bounds = bounds;
        rel.processed = true;
    }

    fn process_ways(&mut self, data: &[u8]) {
        for wi in 0..self.model.ways.len() {
            if !self.model.ways[wi].processed {
                let way = &mut self.model.ways[wi];
                way.tracked = way.tiles != 0;
                self.process_way(wi, data);
            }
            let way = &self.model.ways[wi];
            let (export, bounds) = (way.tracked && way.tiles != 0, way.bounds);
            if export {
                let h = self.hilbert_of(&bounds);
                self.exports.push((h, ExportRef::Way(wi as u32)));
            }
        }
    }

    fn process_way(&mut self, wi: usize, data: &[u8]) {
        let way = &self.model.ways[wi];
        let node_exports = twin_exports(way.twin_code);
        let track = way.tracked;
        let (ofs, len) = way.body;
        let mut bounds = way.bounds;
        let mut c = Cursor::new(&data[ofs as usize..(ofs + len) as usize]);
        let count = c.read_varint() >> 1;
        let mut node_id = 0i64;
        for _ in 0..count {
            node_id += c.read_signed_varint();
            match self.model.index.get(&TypedFeatureId::of_node(node_id as u64).raw()).copied() {
                Some(Slot::LocalNode(i)) => {
                    let node = &mut self.model.nodes[i as usize];
                    node.tiles |= node_exports;
                    node.flags |= FLAG_WAY_NODE;
                    if track {
                        bounds.expand_to_include(node.xy);
                    }
                }
                Some(Slot::ForeignNode(i)) => {
                    if track {
                        bounds.expand_to_include(self.model.foreign_nodes[i as usize].1);
                    }
                }
                _ => {
                    // dropped upstream; the way keeps its remaining shape
                    if self.verbosity >= Verbosity::Debug {
                        eprintln!("[validate] {}: node/{node_id} unresolved", self.current_tile);
                    }
                }
            }
        }
        let way = &mut self.model.ways[wi];
        way.bounds = bounds;
        way.processed = true;
    }

    /// Re-index local nodes by coordinate to find shared locations; nodes
    /// that share one become features.
    fn process_nodes(&mut self) {
        let mut by_location: AHashMap<u64, u32> =
            AHashMap::with_capacity(self.model.nodes.len());
        for ni in 0..self.model.nodes.len() {
            let (xy, exported) = {
                let n = &self.model.nodes[ni];
                (n.xy, n.tiles != 0)
            };
            match by_location.get(&xy.as_u64()) {
                None => {
                    by_location.insert(xy.as_u64(), ni as u32);
                }
                Some(&first) => {
                    let promote = {
                        let other = &self.model.nodes[first as usize];
                        other.tiles != 0 && !other.is_feature()
                    };
                    if promote {
                        // sharing a location promotes the other node to
                        // feature status; it now needs a TEX
                        let h = self.hilbert_of_point(xy);
                        self.exports.push((h, ExportRef::Node(first)));
                    }
                    self.model.nodes[first as usize].flags |= FLAG_SHARES_LOCATION;
                    self.model.nodes[ni].flags |= FLAG_SHARES_LOCATION;
                }
            }
            if exported && self.model.nodes[ni].is_feature() {
                let h = self.hilbert_of_point(xy);
                self.exports.push((h, ExportRef::Node(ni as u32)));
            }
        }
    }

    /// Sort exports by Hilbert position, assign TEXes, and write the
    /// table into this tile's own pile.
    fn build_export_table(&mut self) -> Vec<(u64, u32)> {
        let mut foreign_relations = Vec::new();
        if self.exports.is_empty() {
            return foreign_relations;
        }
        self.exports.sort_by_key(|&(h, _)| h);
        let mut entries = Vec::with_capacity(self.exports.len());
        for (tex, &(_, r)) in self.exports.iter().enumerate() {
            let typed = match r {
                ExportRef::Node(i) => {
                    self.model.nodes[i as usize].tex = tex as i32;
                    TypedFeatureId::of_node(self.model.nodes[i as usize].id)
                }
                ExportRef::Way(i) => {
                    self.model.ways[i as usize].tex = tex as i32;
                    TypedFeatureId::of_way(self.model.ways[i as usize].id)
                }
                ExportRef::Relation(i) => {
                    let rel = &mut self.model.relations[i as usize];
                    rel.tex = tex as i32;
                    foreign_relations.push((rel.id, tex as u32));
                    TypedFeatureId::of_relation(rel.id)
                }
            };
            entries.push(typed);
        }
        self.tray.write_export_table(self.current_pile, &entries);
        self.tray.close_groups();
        foreign_relations.sort_by_key(|&(id, _)| id);
        foreign_relations
    }

    fn export_nodes(&mut self) {
        for ni in 0..self.model.nodes.len() {
            let node = &self.model.nodes[ni];
            debug_assert!(node.tiles & 1 == 0, "node exported to its own tile");
            let mut bits = node.tiles;
            while bits != 0 {
                let slot = bits.trailing_zeros();
                bits &= bits - 1;
                let target = self.target_pile(slot);
                let tex = if node.is_feature() && node.tex >= 0 {
                    Some(node.tex as u32)
                } else {
                    None
                };
                self.tray.write_foreign_node(target, self.current_pile, node.id, node.xy, tex);
            }
            let shared = node.flags & FLAG_SHARES_LOCATION != 0;
            let orphan = node.is_orphan();
            let untagged_member = node.flags & FLAG_RELATION_NODE != 0
                && node.flags & FLAG_TAGGED == 0;
            if shared || orphan || untagged_member {
                let flags = shared as u32 * SPECIAL_SHARED | orphan as u32 * SPECIAL_ORPHAN;
                self.tray.write_special_node(self.current_pile, node.id, flags);
            }
        }
        self.tray.close_groups();
    }

    fn export_features(&mut self, relations: bool) {
        let is_odd = self.current_tile.is_odd();
        let features = if relations { &self.model.relations } else { &self.model.ways };
        let ftype = if relations { FeatureType::Relation } else { FeatureType::Way };
        let mut writes: Vec<(u32, u64, Bbox, u32)> = Vec::new();
        for f in features {
            if f.tiles == 0 {
                continue;
            }
            debug_assert!(f.tex >= 0, "exported feature without a TEX");
            let mut bits = f.tiles;
            while bits != 0 {
                let slot = bits.trailing_zeros();
                bits &= bits - 1;
                // a multi-tile feature's bounds are only complete once its
                // odd tile has received the twin's node exports
                let bounds = if f.twin_code == 0 || is_odd { f.bounds } else { Bbox::empty() };
                writes.push((self.target_pile(slot), f.id, bounds, f.tex as u32));
            }
        }
        for (target, id, bounds, tex) in writes {
            self.tray.write_foreign_feature(target, self.current_pile, ftype, id, &bounds, tex);
        }
        self.tray.close_groups();
    }

    /// Resolve a relative export slot (`zoom_delta * 5 + twin`) to a pile.
    fn target_pile(&self, slot: u32) -> u32 {
        let zoom_delta = slot / 5;
        let twin = slot % 5;
        debug_assert!(zoom_delta <= self.current_tile.zoom());
        let tile = self.current_tile.zoomed_out(self.current_tile.zoom() - zoom_delta);
        let tile = tile.twin(twin).expect("export target beyond the grid");
        let pile = self.tiles.pile_of_tile(tile);
        debug_assert!(pile != 0, "export target {tile} not catalogued");
        pile
    }

    fn hilbert_of(&self, bounds: &Bbox) -> u32 {
        if bounds.is_empty() {
            return 0;
        }
        self.hilbert_of_point(bounds.center())
    }

    fn hilbert_of_point(&self, c: Coordinate) -> u32 {
        self.current_tile.hilbert_within(c)
    }
}
