//! Deferred resolution of relations that contain other relations.
//!
//! Super-relations ideally form a DAG; reference cycles are broken by
//! removing one member link from the lowest-scoring relation in the cycle
//! (ties lose by lower id, keeping builds reproducible). Every relation
//! ends up with a level: 0 when no relation members survive, otherwise
//! one more than the deepest surviving child. Relations nested deeper
//! than `MAX_RELATION_LEVEL` are dropped.

use ahash::AHashMap;

use crate::build::id_index::FastIndex;
use crate::build::proto::{read_proto_string, skip_proto_string, StrKind};
use crate::build::strings::StringCatalog;
use crate::build::tiles::TileCatalog;
use crate::common::varint::Cursor;
use crate::feature::TypedFeatureId;
use crate::geom::TilePair;

pub const MAX_RELATION_LEVEL: u32 = 9;

/// One member of a sorted relation. A `typed_id` of 0 marks a member that
/// was cleared (missing, or removed to break a cycle).
#[derive(Copy, Clone, Debug)]
pub struct ChildFeature {
    pub typed_id: u64,
    pub pile_pair: u32,
    pub tile_pair: Option<TilePair>,
}

/// A relation deferred in the sort phase because at least one member is a
/// relation. Owns its member list and its encoded body (members + tags).
pub struct SuperRelation {
    pub id: u64,
    pub tile_pair: Option<TilePair>,
    pub pile_pair: u32,
    pub members: Vec<ChildFeature>,
    pub body: Vec<u8>,
    pub missing_count: u32,
    pub removed_refcycle_count: u32,
    pub highest_member_zoom: u32,
    pub level: u32,
    state: State,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum State {
    Unresolved,
    Pending,
    Resolved,
}

impl SuperRelation {
    pub fn new(
        id: u64,
        tentative_tile_pair: Option<TilePair>,
        members: Vec<ChildFeature>,
        body: Vec<u8>,
        missing_count: u32,
    ) -> SuperRelation {
        SuperRelation {
            id,
            tile_pair: tentative_tile_pair,
            pile_pair: 0,
            members,
            body,
            missing_count,
            removed_refcycle_count: 0,
            highest_member_zoom: 0,
            level: 0,
            state: State::Unresolved,
        }
    }

    fn clear_member(&mut self, typed_id: u64) {
        if let Some(m) = self.members.iter_mut().find(|m| m.typed_id == typed_id) {
            m.typed_id = 0;
        }
    }

    /// Settle the member list after resolution: drop cleared members from
    /// the body, fold them into the missing count, and compute the
    /// highest member zoom.
    fn validate(&mut self) {
        let removed =
            self.members.iter().filter(|m| m.typed_id == 0).count() as u32;
        self.highest_member_zoom = self
            .members
            .iter()
            .filter(|m| m.typed_id != 0)
            .filter_map(|m| m.tile_pair)
            .map(|tp| tp.zoom())
            .max()
            .unwrap_or(0);
        self.missing_count += removed.saturating_sub(self.removed_refcycle_count);
        if removed > 0 {
            self.recode();
        }
    }

    /// Re-encode the body without the cleared member entries.
    fn recode(&mut self) {
        let mut out = Vec::with_capacity(self.body.len());
        let mut kept = Vec::with_capacity(self.members.len());
        let mut c = Cursor::new(&self.body);
        for member in &self.members {
            let start = c.pos();
            let _typed = c.read_varint();
            skip_proto_string(&mut c);
            if member.typed_id != 0 {
                out.extend_from_slice(&self.body[start..c.pos()]);
                kept.push(*member);
            }
        }
        out.extend_from_slice(&self.body[c.pos()..]); // tags
        self.members = kept;
        self.body = out;
    }
}

pub struct SuperRelationResolver<'a> {
    relations: Vec<SuperRelation>,
    by_id: AHashMap<u64, usize>,
    tiles: &'a TileCatalog,
    strings: &'a StringCatalog,
    relation_index: &'a FastIndex,
    /// (relation, child) pairs along a detected cycle
    cyclical: Vec<(usize, usize)>,
    pub dropped_count: u64,
}

impl<'a> SuperRelationResolver<'a> {
    pub fn new(
        mut relations: Vec<SuperRelation>,
        tiles: &'a TileCatalog,
        strings: &'a StringCatalog,
        relation_index: &'a FastIndex,
    ) -> SuperRelationResolver<'a> {
        // id order makes cycle traversal independent of worker scheduling
        relations.sort_by_key(|r| r.id);
        let by_id = relations.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
        SuperRelationResolver {
            relations,
            by_id,
            tiles,
            strings,
            relation_index,
            cyclical: Vec::new(),
            dropped_count: 0,
        }
    }

    /// Resolve all relations and hand them back grouped by level, sorted
    /// by id within each level.
    pub fn resolve(mut self) -> (Vec<SuperRelation>, Vec<Vec<usize>>, u64) {
        for idx in 0..self.relations.len() {
            if self.relations[idx].state != State::Resolved {
                let ok = self.resolve_one(idx);
                debug_assert!(ok, "top-level resolution cannot unwind");
            }
        }
        let mut levels: Vec<Vec<usize>> = vec![Vec::new(); MAX_RELATION_LEVEL as usize + 1];
        for (idx, rel) in self.relations.iter().enumerate() {
            if rel.tile_pair.is_none() {
                self.dropped_count += 1; // all members missing or omitted
            } else if rel.level > MAX_RELATION_LEVEL {
                self.dropped_count += 1; // nested too deeply
            } else {
                levels[rel.level as usize].push(idx);
            }
        }
        for level in &mut levels {
            level.sort_by_key(|&idx| self.relations[idx].id);
        }
        (self.relations, levels, self.dropped_count)
    }

    /// Post-order DFS. Returns `false` while unwinding toward the root of
    /// a detected reference cycle.
    fn resolve_one(&mut self, idx: usize) -> bool {
        debug_assert!(self.relations[idx].state == State::Unresolved);
        self.relations[idx].state = State::Pending;
        let mut tile_pair = self.relations[idx].tile_pair;
        let mut max_child_level: Option<u32> = None;

        for mi in 0..self.relations[idx].members.len() {
            let member = self.relations[idx].members[mi];
            if member.typed_id == 0 || member.typed_id & 3 != 2 {
                continue;
            }
            let member_id = member.typed_id >> 2;
            let (member_pile_pair, member_tile_pair, child_level) = {
                let indexed = self.relation_index.get(member_id) as u32;
                if indexed != 0 {
                    // a regular relation, already sorted and indexed
                    (indexed, self.tiles.tile_pair_of_pile_pair(indexed), 0)
                } else {
                    let Some(&child) = self.by_id.get(&member_id) else {
                        // missing entirely; count it later via recode
                        self.relations[idx].members[mi].typed_id = 0;
                        continue;
                    };
                    if self.relations[idx].members[mi].typed_id == 0 {
                        continue;
                    }
                    if self.relations[child].state != State::Resolved {
                        if self.relations[child].state == State::Pending {
                            // reference cycle: start unwinding to its root
                            debug_assert!(self.cyclical.is_empty());
                            self.cyclical.push((idx, child));
                            self.relations[idx].state = State::Unresolved;
                            return false;
                        }
                        loop {
                            if self.resolve_one(child) {
                                break;
                            }
                            self.cyclical.push((idx, child));
                            if self.relations[self.cyclical[0].1].id == self.relations[idx].id {
                                // this relation roots the cycle; break it here
                                let loser = self.break_reference_cycle();
                                if loser == idx {
                                    break;
                                }
                            } else {
                                self.relations[idx].state = State::Unresolved;
                                return false;
                            }
                        }
                    }
                    if self.relations[idx].members[mi].typed_id == 0 {
                        continue;
                    }
                    let (child_pp, child_tp, child_level) = {
                        let c = &self.relations[child];
                        (c.pile_pair, c.tile_pair, c.level)
                    };
                    match child_tp {
                        None => {
                            self.relations[idx].members[mi].typed_id = 0;
                            continue;
                        }
                        Some(tp) => (child_pp, tp, child_level),
                    }
                }
            };
            max_child_level = Some(max_child_level.unwrap_or(0).max(child_level));
            let m = &mut self.relations[idx].members[mi];
            m.pile_pair = member_pile_pair;
            m.tile_pair = Some(member_tile_pair);
            tile_pair = Some(match tile_pair {
                None => member_tile_pair,
                Some(tp) => {
                    let mut merged = tp;
                    merged = merged.add(member_tile_pair.first());
                    if let Some(second) = member_tile_pair.second() {
                        merged = merged.add(second);
                    }
                    merged
                }
            });
        }

        let rel = &mut self.relations[idx];
        if let Some(tp) = tile_pair {
            let tp = self.tiles.normalized_tile_pair(tp);
            rel.tile_pair = Some(tp);
            rel.pile_pair = self.tiles.pile_pair_of_tile_pair(tp);
        } else {
            rel.tile_pair = None;
        }
        rel.state = State::Resolved;
        rel.level = match max_child_level {
            None => 0,
            Some(level) => level + 1,
        };
        rel.validate();
        true
    }

    /// Remove one member link from the lowest-scoring relation in the
    /// recorded cycle; equal scores lose by lower id.
    fn break_reference_cycle(&mut self) -> usize {
        debug_assert!(self.cyclical.len() >= 2);
        let mut scored: Vec<(f64, u64, usize, usize)> = self
            .cyclical
            .iter()
            .map(|&(rel, child)| (self.score(rel), self.relations[rel].id, rel, child))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));
        let (_, _, loser, child) = scored[0];
        let child_typed_id = TypedFeatureId::of_relation(self.relations[child].id).raw();
        self.relations[loser].clear_member(child_typed_id);
        self.relations[loser].removed_refcycle_count += 1;
        self.cyclical.clear();
        loser
    }

    /// Tag-weighted likelihood that a relation sits near the top of the
    /// hierarchy, so the break happens low in it.
    fn score(&self, idx: usize) -> f64 {
        let rel = &self.relations[idx];
        let mut score = 0.0;
        let mut c = Cursor::new(&rel.body);
        let mut non_relation_members = 0u64;
        for _ in 0..rel.members.len() {
            let typed = c.read_varint();
            skip_proto_string(&mut c);
            if typed & 3 != 2 {
                non_relation_members += 1;
            }
        }
        if non_relation_members == 0 {
            score += 1_000_000_000.0;
        } else {
            score += non_relation_members as f64;
        }
        while !c.is_empty() {
            let (_, key) = read_proto_string(&mut c, StrKind::Key, self.strings);
            let (_, value) = read_proto_string(&mut c, StrKind::Value, self.strings);
            if key == "type" {
                score += match value {
                    "network" => 100_000_000.0,
                    "superroute" | "route_master" => 50_000_000.0,
                    "site" => 20_000_000.0,
                    _ => 0.0,
                };
            } else if key == "admin_level" {
                if let Ok(level) = value.parse::<f64>() {
                    score += (14.0 - level) * 1_000_000.0;
                }
            }
        }
        score
    }
}
