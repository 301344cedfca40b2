//! Phase 2: route every feature into its tile pile(s), encoding bodies in
//! Proto-GOL and populating the feature-id indexes.
//!
//! The pass runs in four strictly ordered sub-phases — nodes, ways,
//! relations, super-relations — separated by barriers so that the id
//! index a sub-phase reads is always complete. One designated worker runs
//! the super-relation pass after everyone has finished relations.

mod phaser;
pub mod super_relation;

use std::sync::Arc;

use parking_lot::Mutex;

use anyhow::Result;

use self::phaser::Phaser;
use self::super_relation::{ChildFeature, SuperRelation, SuperRelationResolver};
use crate::build::id_index::{FastIndex, MappedIndex};
use crate::build::pile::PileFile;
use crate::build::progress::{Phase, Progress};
use crate::build::proto::{write_proto_string, Locator, PileTray};
use crate::build::stats::SortStats;
use crate::build::strings::{ProtoStringPair, StringCatalog};
use crate::build::tiles::TileCatalog;
use crate::common::{CancelFlag, Verbosity};
use crate::feature::{FeatureType, TypedFeatureId};
use crate::geom::{Coordinate, TilePair};
use crate::osm::reader::{scan, OsmWorker, OutputQueue};
use crate::osm::{BlockSource, RawNode, RawRelation, RawWay};

const PHASE_NODES: usize = 0;
const PHASE_WAYS: usize = 1;
const PHASE_RELATIONS: usize = 2;
const PHASE_SUPER: usize = 3;

const TASK_NAMES: [&str; 4] = [
    "Sorting nodes...",
    "Sorting ways...",
    "Sorting relations...",
    "Sorting super-relations...",
];

/// One worker flush: pile batches plus how many primitives they cover.
pub struct SortBatch {
    piles: Vec<(u32, Vec<u8>)>,
    units: u64,
}

/// Run the sort pass. `total_units` is the primitive count from analyze,
/// used for progress only.
#[allow(clippy::too_many_arguments)]
pub fn sort<S: BlockSource>(
    source: S,
    thread_count: usize,
    tiles: &TileCatalog,
    strings: &StringCatalog,
    indexes: &[Arc<MappedIndex>; 3],
    piles: &PileFile,
    progress: &mut Progress,
    total_units: u64,
    verbosity: Verbosity,
    cancel: &CancelFlag,
) -> Result<SortStats> {
    let phaser = Phaser::new(3, thread_count as u32, &TASK_NAMES, verbosity);
    let super_pool: Mutex<Vec<SuperRelation>> = Mutex::new(Vec::new());

    progress.begin_phase(Phase::Sort, total_units);
    progress.task(TASK_NAMES[PHASE_NODES]);

    let workers: Vec<SorterWorker> = (0..thread_count)
        .map(|i| SorterWorker::new(tiles, strings, indexes, &phaser, &super_pool, i == 0, verbosity))
        .collect();

    let mut io_error: Option<anyhow::Error> = None;
    let (workers, _) = scan(
        source,
        workers,
        |batch: SortBatch| {
            if io_error.is_none() {
                for (pile, data) in &batch.piles {
                    if let Err(e) = piles.append(*pile, data) {
                        io_error = Some(e);
                        break;
                    }
                }
            }
            progress.advance(batch.units);
        },
        cancel,
    )?;
    if let Some(e) = io_error {
        return Err(e);
    }

    let mut stats = SortStats::default();
    for worker in &workers {
        stats += worker.stats;
    }
    if verbosity >= Verbosity::Verbose {
        eprintln!("[sort] {:>14} nodes", stats.node_count);
        eprintln!("[sort] {:>14} ways ({} multi-tile, {} ghosts)",
            stats.way_count, stats.multitile_way_count, stats.ghost_way_count);
        eprintln!("[sort] {:>14} way nodes", stats.way_node_count);
        eprintln!("[sort] {:>14} relations ({} super, {} empty)",
            stats.relation_count, stats.super_relation_count, stats.empty_relation_count);
        eprintln!("[sort] {:>14} members ({} foreign, {} missing nodes)",
            stats.member_count, stats.foreign_member_count, stats.missing_node_count);
        if stats.ref_cycle_count > 0 {
            eprintln!("[sort] {:>14} reference cycles broken", stats.ref_cycle_count);
        }
    }
    Ok(stats)
}

struct SorterWorker<'a> {
    tiles: &'a TileCatalog,
    strings: &'a StringCatalog,
    phaser: &'a Phaser,
    super_pool: &'a Mutex<Vec<SuperRelation>>,
    indexes: [FastIndex; 3],
    /// per-block: block string index -> proto codes
    translation: Vec<ProtoStringPair>,
    tray: PileTray,
    body_buf: Vec<u8>,
    node_buf: Vec<u8>,
    way_nodes: Vec<(i64, u32)>,
    children: Vec<ChildFeature>,
    supers: Vec<SuperRelation>,
    phase: usize,
    batch_count: u64,
    units: u64,
    stats: SortStats,
    is_main: bool,
    verbosity: Verbosity,
}

impl<'a> SorterWorker<'a> {
    fn new(
        tiles: &'a TileCatalog,
        strings: &'a StringCatalog,
        indexes: &[Arc<MappedIndex>; 3],
        phaser: &'a Phaser,
        super_pool: &'a Mutex<Vec<SuperRelation>>,
        is_main: bool,
        verbosity: Verbosity,
    ) -> SorterWorker<'a> {
        SorterWorker {
            tiles,
            strings,
            phaser,
            super_pool,
            indexes: [
                FastIndex::new(Arc::clone(&indexes[0])),
                FastIndex::new(Arc::clone(&indexes[1])),
                FastIndex::new(Arc::clone(&indexes[2])),
            ],
            translation: Vec::new(),
            tray: PileTray::default(),
            body_buf: Vec::new(),
            node_buf: Vec::new(),
            way_nodes: Vec::new(),
            children: Vec::new(),
            supers: Vec::new(),
            phase: PHASE_NODES,
            batch_count: 0,
            units: 0,
            stats: SortStats::default(),
            is_main,
            verbosity,
        }
    }

    fn batch_size(phase: usize) -> u64 {
        if phase == PHASE_NODES {
            1 << 20
        } else {
            1 << 15
        }
    }

    fn flush_piles(&mut self, out: &OutputQueue<SortBatch>) {
        if self.tray.is_empty() && self.units == 0 {
            return;
        }
        let batch = SortBatch { piles: self.tray.drain(), units: self.units };
        self.units = 0;
        self.batch_count = 0;
        out.post(batch);
    }

    fn flush_index(&mut self) {
        if self.phase <= PHASE_RELATIONS {
            self.indexes[self.phase].end_batch();
        }
    }

    fn advance_phase(&mut self, target: usize, out: &OutputQueue<SortBatch>) {
        self.flush_piles(out);
        self.flush_index();
        if target == PHASE_SUPER {
            // deposit deferred relations before anyone can start resolving
            self.super_pool.lock().append(&mut self.supers);
        }
        self.phaser.advance(self.phase, target);
        self.phase = target;
    }

    fn index_feature(&mut self, id: u64, value: u64, out: &OutputQueue<SortBatch>) {
        self.indexes[self.phase].put(id, value);
        self.batch_count += 1;
        if self.batch_count >= Self::batch_size(self.phase) {
            self.flush_piles(out);
        }
    }

    fn encode_string(&mut self, index: u32, as_key: bool, strings: &[String]) {
        let pair = self.translation[index as usize];
        let code = if as_key { pair.key } else { pair.value };
        write_proto_string(&mut self.body_buf, code, &strings[index as usize]);
    }

    fn encode_tags(&mut self, keys: &[u32], values: &[u32], strings: &[String]) {
        for (&k, &v) in keys.iter().zip(values) {
            self.encode_string(k, true, strings);
            self.encode_string(v, false, strings);
        }
    }

    /// Write a relation into both pair piles, plus membership records into
    /// the tiles of members living at deeper zoom levels.
    #[allow(clippy::too_many_arguments)]
    fn write_relation_full(
        &mut self,
        id: u64,
        pile_pair: u32,
        tile_pair: TilePair,
        members: &[ChildFeature],
        highest_member_zoom: u32,
        body: &[u8],
        missing_count: u32,
        removed_count: u32,
    ) {
        debug_assert!(pile_pair != 0);
        let mut extra = Vec::new();
        if missing_count > 0 {
            write_proto_string(&mut extra, None, "geodesk:missing_members");
            write_proto_string(&mut extra, None, &missing_count.to_string());
        }
        if removed_count > 0 {
            write_proto_string(&mut extra, None, "geodesk:removed_refcycles");
            write_proto_string(&mut extra, None, &removed_count.to_string());
        }

        // A relation with members deeper than itself must always be
        // exported; the flag rides in the locator's zoom-delta bit.
        let has_higher_members = highest_member_zoom > tile_pair.zoom();
        let first_pile = pile_pair >> 2;
        let locator = Locator::new(tile_pair.twin_code_from(tile_pair.first()), 0)
            .with_export_flag(has_higher_members);
        self.tray.write_relation(first_pile, id, locator, members.len() as u32, body, &extra);
        if let Some(second) = tile_pair.second() {
            let second_pile = self.tiles.pile_of_tile(second);
            debug_assert!(second_pile != 0 && second_pile != first_pile);
            let locator = Locator::new(tile_pair.twin_code_from(second), 0)
                .with_export_flag(has_higher_members);
            self.tray.write_relation(second_pile, id, locator, members.len() as u32, body, &extra);
        }

        if has_higher_members {
            for child in members {
                if child.typed_id == 0 {
                    continue;
                }
                let Some(child_pair) = child.tile_pair else { continue };
                if child_pair.zoom() <= tile_pair.zoom() {
                    continue;
                }
                let member = TypedFeatureId::from_raw(child.typed_id);
                let first_tile = child_pair.first();
                let locator = Locator::new(
                    tile_pair.twin_code_from(first_tile),
                    first_tile.zoom() - tile_pair.zoom(),
                );
                self.tray.write_membership(child.pile_pair >> 2, id, locator, member);
                if let Some(second_tile) = child_pair.second() {
                    let second_pile = self.tiles.pile_of_tile(second_tile);
                    debug_assert!(second_pile != 0);
                    let locator = Locator::new(
                        tile_pair.twin_code_from(second_tile),
                        second_tile.zoom() - tile_pair.zoom(),
                    );
                    self.tray.write_membership(second_pile, id, locator, member);
                }
                self.stats.foreign_member_count += 1;
            }
        }
    }

    /// The designated worker resolves and writes all deferred relations
    /// once every worker has passed the relation barrier.
    fn resolve_super_relations(&mut self, out: &OutputQueue<SortBatch>) {
        let supers = std::mem::take(&mut *self.super_pool.lock());
        if supers.is_empty() {
            return;
        }
        let resolver =
            SuperRelationResolver::new(supers, self.tiles, self.strings, &self.indexes[2]);
        let (relations, levels, _dropped) = resolver.resolve();
        for level in &levels {
            for &idx in level {
                let rel = &relations[idx];
                let tile_pair = rel.tile_pair.expect("levelled relations are placed");
                debug_assert!(rel.pile_pair != 0);
                self.stats.ref_cycle_count += rel.removed_refcycle_count as u64;
                self.write_relation_full(
                    rel.id,
                    rel.pile_pair,
                    tile_pair,
                    &rel.members,
                    rel.highest_member_zoom,
                    &rel.body,
                    rel.missing_count,
                    rel.removed_refcycle_count,
                );
                self.indexes[PHASE_RELATIONS].put(rel.id, rel.pile_pair as u64);
            }
            // parents resolve children through the index, level by level
            self.indexes[PHASE_RELATIONS].end_batch();
            self.flush_piles(out);
        }
    }

    fn log_verbose(&self, args: std::fmt::Arguments) {
        if self.verbosity >= Verbosity::Verbose {
            eprintln!("[sort] {args}");
        }
    }
}

impl OsmWorker for SorterWorker<'_> {
    type Output = SortBatch;

    fn string_table(&mut self, strings: &[String]) {
        debug_assert!(self.translation.is_empty());
        self.translation = strings.iter().map(|s| self.strings.proto_pair(s)).collect();
    }

    fn node(&mut self, node: &RawNode, strings: &[String], out: &OutputQueue<SortBatch>) {
        debug_assert!(self.body_buf.is_empty());
        let xy = Coordinate::from_lon_lat_100nd(node.lon, node.lat);
        let pile = self.tiles.pile_of_coordinate(xy);
        debug_assert!(pile >= 1);
        for pair in node.tags.chunks_exact(2) {
            self.encode_string(pair[0], true, strings);
            self.encode_string(pair[1], false, strings);
        }
        let tags = std::mem::take(&mut self.body_buf);
        self.tray.write_node(pile, node.id as u64, xy, &tags);
        self.body_buf = tags;
        self.body_buf.clear();
        self.index_feature(node.id as u64, pile as u64, out);
        self.units += 1;
        self.stats.node_count += 1;
    }

    fn begin_way_group(&mut self, out: &OutputQueue<SortBatch>) {
        if self.phase != PHASE_WAYS {
            self.advance_phase(PHASE_WAYS, out);
        }
    }

    fn way(&mut self, way: &RawWay, strings: &[String], out: &OutputQueue<SortBatch>) {
        debug_assert!(self.body_buf.is_empty() && self.way_nodes.is_empty());
        self.units += 1;

        for &node_id in &way.nodes {
            let pile = self.indexes[PHASE_NODES].get(node_id as u64) as u32;
            if pile == 0 {
                self.log_verbose(format_args!("node/{node_id} not found in node index"));
                self.stats.missing_node_count += 1;
                continue;
            }
            self.way_nodes.push((node_id, pile));
        }

        if self.way_nodes.len() < 2 {
            self.log_verbose(format_args!(
                "Rejected way/{} with {} nodes",
                way.id,
                self.way_nodes.len()
            ));
            self.stats.rejected_way_count += 1;
            self.way_nodes.clear();
            return;
        }
        let mut is_closed_ring = false;
        if self.way_nodes.first().map(|n| n.0) == self.way_nodes.last().map(|n| n.0) {
            self.way_nodes.pop();
            is_closed_ring = true;
            if self.way_nodes.len() < 3 {
                self.log_verbose(format_args!("Rejected way/{} (invalid closed ring)", way.id));
                self.stats.rejected_way_count += 1;
                self.way_nodes.clear();
                return;
            }
        }
        let tagged_node_count = ((self.way_nodes.len() as u32) << 1) | is_closed_ring as u32;

        self.encode_tags(&way.keys, &way.values, strings);
        let tags = std::mem::take(&mut self.body_buf);

        let mut node_buf = std::mem::take(&mut self.node_buf);
        node_buf.clear();
        encode_node_ids(&mut node_buf, self.way_nodes.iter().map(|n| n.0));

        let single_pile = self.way_nodes[0].1;
        let id = way.id as u64;
        if self.way_nodes.iter().all(|n| n.1 == single_pile) {
            self.tray.write_way(
                single_pile,
                id,
                Locator::default(),
                tagged_node_count,
                &node_buf,
                &tags,
            );
            self.index_feature(id, (single_pile as u64) << 2, out);
        } else {
            self.multi_tile_way(id, tagged_node_count, &node_buf, &tags, out);
        }
        self.stats.way_count += 1;
        self.stats.way_node_count += self.way_nodes.len() as u64;
        self.node_buf = node_buf;
        self.body_buf = tags;
        self.body_buf.clear();
        self.way_nodes.clear();
    }

    fn begin_relation_group(&mut self, out: &OutputQueue<SortBatch>) {
        if self.phase != PHASE_RELATIONS {
            self.advance_phase(PHASE_RELATIONS, out);
        }
    }

    fn relation(&mut self, rel: &RawRelation, strings: &[String], out: &OutputQueue<SortBatch>) {
        debug_assert!(self.body_buf.is_empty() && self.children.is_empty());
        self.units += 1;
        self.stats.relation_count += 1;

        let mut tile_pair: Option<TilePair> = None;
        let mut highest_member_zoom = 0;
        let mut missing_count = 0u32;
        let mut is_super = false;

        for m in &rel.members {
            if m.mtype == FeatureType::Relation && m.id == rel.id {
                self.log_verbose(format_args!("relation/{}: Removed self-reference", rel.id));
                continue;
            }
            let (member_pile_pair, member_tile_pair) = if m.mtype == FeatureType::Relation {
                is_super = true;
                (0, None)
            } else {
                let raw = self.indexes[m.mtype as usize].get(m.id as u64) as u32;
                // node index stores a plain pile; make it a pile pair
                let pp = if m.mtype == FeatureType::Node { raw << 2 } else { raw };
                if pp == 0 {
                    missing_count += 1;
                    continue;
                }
                let mtp = self.tiles.tile_pair_of_pile_pair(pp);
                highest_member_zoom = highest_member_zoom.max(mtp.zoom());
                tile_pair = Some(match tile_pair {
                    None => mtp,
                    Some(tp) => {
                        let mut merged = tp.add(mtp.first());
                        if let Some(second) = mtp.second() {
                            merged = merged.add(second);
                        }
                        merged
                    }
                });
                (pp, Some(mtp))
            };
            let typed = TypedFeatureId::new(m.mtype, m.id as u64);
            crate::common::varint::write_varint(&mut self.body_buf, typed.raw());
            self.encode_string(m.role, false, strings);
            self.children.push(ChildFeature {
                typed_id: typed.raw(),
                pile_pair: member_pile_pair,
                tile_pair: member_tile_pair,
            });
            self.stats.member_count += 1;
        }

        self.encode_tags(&rel.keys, &rel.values, strings);

        if self.children.is_empty() {
            // empty, or every member missing: nowhere to place it
            self.stats.empty_relation_count += 1;
        } else if is_super {
            self.supers.push(SuperRelation::new(
                rel.id as u64,
                tile_pair,
                std::mem::take(&mut self.children),
                std::mem::take(&mut self.body_buf),
                missing_count,
            ));
            self.stats.super_relation_count += 1;
        } else {
            let tile_pair = self
                .tiles
                .normalized_tile_pair(tile_pair.expect("non-super relation has placed members"));
            let pile_pair = self.tiles.pile_pair_of_tile_pair(tile_pair);
            let body = std::mem::take(&mut self.body_buf);
            let children = std::mem::take(&mut self.children);
            self.write_relation_full(
                rel.id as u64,
                pile_pair,
                tile_pair,
                &children,
                highest_member_zoom,
                &body,
                missing_count,
                0,
            );
            self.index_feature(rel.id as u64, pile_pair as u64, out);
            self.body_buf = body;
            self.children = children;
        }
        self.body_buf.clear();
        self.children.clear();
    }

    fn end_block(&mut self, _out: &OutputQueue<SortBatch>) {
        // flush the index so writes never straddle a block boundary
        self.flush_index();
        self.translation.clear();
    }

    fn after_tasks(&mut self, out: &OutputQueue<SortBatch>) {
        self.advance_phase(PHASE_SUPER, out);
        debug_assert!(!self.indexes.iter().any(|i| i.has_pending_writes()));
        if self.is_main {
            self.resolve_super_relations(out);
            self.flush_piles(out);
        }
    }
}

impl SorterWorker<'_> {
    fn multi_tile_way(
        &mut self,
        id: u64,
        tagged_node_count: u32,
        node_buf: &[u8],
        tags: &[u8],
        out: &OutputQueue<SortBatch>,
    ) {
        // accumulate the tile pair over the nodes' tiles
        let mut tile_pair: Option<TilePair> = None;
        let mut highest_node_zoom = 0;
        let mut prev_pile = 0;
        for &(_, pile) in &self.way_nodes {
            if pile == prev_pile {
                continue;
            }
            let tile = self.tiles.tile_of_pile(pile);
            highest_node_zoom = highest_node_zoom.max(tile.zoom());
            tile_pair = Some(match tile_pair {
                None => TilePair::single(tile),
                Some(tp) => tp.add(tile),
            });
            prev_pile = pile;
        }
        let tile_pair = self.tiles.normalized_tile_pair(tile_pair.expect("way has nodes"));
        let pile_pair = self.tiles.pile_pair_of_tile_pair(tile_pair);
        debug_assert!(pile_pair != 0);

        let first_pile = pile_pair >> 2;
        let locator = Locator::new(tile_pair.twin_code_from(tile_pair.first()), 0);
        self.tray.write_way(first_pile, id, locator, tagged_node_count, node_buf, tags);
        if let Some(second) = tile_pair.second() {
            let second_pile = self.tiles.pile_of_tile(second);
            debug_assert!(second_pile != 0 && second_pile != first_pile);
            let locator = Locator::new(tile_pair.twin_code_from(second), 0);
            self.tray.write_way(second_pile, id, locator, tagged_node_count, node_buf, tags);
        }
        self.stats.multitile_way_count += 1;

        if highest_node_zoom > tile_pair.zoom() {
            // ghost ways: tiles that hold some of our nodes but not us
            let mut ghost_piles: smallvec::SmallVec<[u32; 8]> = smallvec::SmallVec::new();
            let mut ghost_buf = Vec::new();
            for i in 0..self.way_nodes.len() {
                let (_, pile) = self.way_nodes[i];
                let tile = self.tiles.tile_of_pile(pile);
                if tile.zoom() <= tile_pair.zoom() || ghost_piles.contains(&pile) {
                    continue;
                }
                ghost_piles.push(pile);
                ghost_buf.clear();
                let ghost_nodes =
                    self.way_nodes.iter().filter(|n| n.1 == pile).map(|n| n.0);
                let count = encode_node_ids(&mut ghost_buf, ghost_nodes);
                let locator =
                    Locator::new(tile_pair.twin_code_from(tile), tile.zoom() - tile_pair.zoom());
                self.tray.write_way(pile, id, locator, (count as u32) << 1, &ghost_buf, &[]);
                self.stats.ghost_way_count += 1;
            }
        }
        self.index_feature(id, pile_pair as u64, out);
    }
}

/// Delta-encode node ids; returns how many were written.
fn encode_node_ids(buf: &mut Vec<u8>, ids: impl Iterator<Item = i64>) -> usize {
    let mut prev = 0i64;
    let mut count = 0;
    for id in ids {
        crate::common::varint::write_signed_varint(buf, id - prev);
        prev = id;
        count += 1;
    }
    count
}
