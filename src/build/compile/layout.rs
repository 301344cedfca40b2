//! Final binary layout of one compiled tile.
//!
//! ```text
//! header (64 bytes): magic, tile bbox, section offsets, feature count
//! strings:  varint count, then varint-length-prefixed strings
//! tags:     varint table count, then deduplicated tag tables
//! features: varint count, u32 offset table, then records in index order
//! indexes:  nodes, non-area ways, areas, non-area relations
//! exports:  varint count, u64 typed ids in TEX order
//! ```
//!
//! Feature records are varint-packed; local relation members reference
//! features by their sequence number, foreign members by (pile, TEX).

use ahash::AHashMap;

use super::model::{CompModel, MemberRef, TagKey, TagList, TagValue};
use super::spatial::SpatialIndex;
use crate::common::varint::{write_signed_varint, write_varint};
use crate::feature::TypedFeatureId;
use crate::geom::Bbox;

pub const TILE_MAGIC: u32 = 0x3142_5447; // "GTB1"
pub const HEADER_LEN: usize = 64;

pub const FLAG_AREA: u64 = 1;
pub const FLAG_RING: u64 = 2;
pub const FLAG_ORPHAN: u64 = 4;
pub const FLAG_SHARED: u64 = 8;
pub const FLAG_PARENTS: u64 = 16;
pub const FLAG_WAYNODE_IDS: u64 = 32;
pub const FLAG_TAGS: u64 = 64;

/// Which feature list an index slot refers to. The area index mixes ways
/// and relations, so its slots carry the high bit for relations.
pub const AREA_RELATION_BIT: u32 = 1 << 31;

#[derive(Copy, Clone)]
enum FeatRef {
    Node(u32),
    Way(u32),
    Relation(u32),
}

pub struct TileIndexes {
    pub nodes: SpatialIndex,
    pub ways: SpatialIndex,
    pub areas: SpatialIndex,
    pub relations: SpatialIndex,
}

pub fn serialize_tile(
    model: &CompModel,
    indexes: &TileIndexes,
    include_waynode_ids: bool,
    tex_of_parent: impl Fn(u32, u64) -> Option<u32>,
) -> Vec<u8> {
    // feature sequence: nodes, non-area ways, areas, non-area relations
    let mut order: Vec<FeatRef> = Vec::new();
    for sub in &indexes.nodes.sub_indexes {
        for item in &sub.items {
            order.push(FeatRef::Node(item.slot));
        }
    }
    for sub in &indexes.ways.sub_indexes {
        for item in &sub.items {
            order.push(FeatRef::Way(item.slot));
        }
    }
    for sub in &indexes.areas.sub_indexes {
        for item in &sub.items {
            order.push(if item.slot & AREA_RELATION_BIT != 0 {
                FeatRef::Relation(item.slot & !AREA_RELATION_BIT)
            } else {
                FeatRef::Way(item.slot)
            });
        }
    }
    for sub in &indexes.relations.sub_indexes {
        for item in &sub.items {
            order.push(FeatRef::Relation(item.slot));
        }
    }

    let mut seq_of: AHashMap<u64, u32> = AHashMap::with_capacity(order.len());
    for (seq, &f) in order.iter().enumerate() {
        let typed = match f {
            FeatRef::Node(i) => TypedFeatureId::of_node(model.nodes[i as usize].id),
            FeatRef::Way(i) => TypedFeatureId::of_way(model.ways[i as usize].id),
            FeatRef::Relation(i) => TypedFeatureId::of_relation(model.relations[i as usize].id),
        };
        seq_of.insert(typed.raw(), seq as u32);
    }

    // local strings by usage, most used first, ties alphabetically
    let mut usage = vec![0u64; model.local_strings.len()];
    fn count_tags(usage: &mut [u64], tags: &TagList) {
        for &(k, v) in tags {
            if let TagKey::Local(i) = k {
                usage[i as usize] += 1;
            }
            if let TagValue::Local(i) = v {
                usage[i as usize] += 1;
            }
        }
    }
    for n in &model.nodes {
        count_tags(&mut usage, &n.tags);
    }
    for w in &model.ways {
        count_tags(&mut usage, &w.tags);
    }
    for r in &model.relations {
        count_tags(&mut usage, &r.tags);
        for m in &r.members {
            if let TagValue::Local(i) = m.role {
                usage[i as usize] += 1;
            }
        }
    }
    let mut string_order: Vec<u32> = (0..model.local_strings.len() as u32).collect();
    string_order.sort_by(|&a, &b| {
        usage[b as usize]
            .cmp(&usage[a as usize])
            .then_with(|| model.local_strings[a as usize].cmp(&model.local_strings[b as usize]))
    });
    let mut remap = vec![0u32; string_order.len()];
    for (new, &old) in string_order.iter().enumerate() {
        remap[old as usize] = new as u32;
    }

    let mut strings_section = Vec::new();
    write_varint(&mut strings_section, string_order.len() as u64);
    for &old in &string_order {
        let s = &model.local_strings[old as usize];
        write_varint(&mut strings_section, s.len() as u64);
        strings_section.extend_from_slice(s.as_bytes());
    }

    // deduplicated tag tables
    let mut tag_section = Vec::new();
    let mut tag_tables: AHashMap<Vec<u8>, u32> = AHashMap::new();
    let mut tag_bodies: Vec<Vec<u8>> = Vec::new();
    let mut table_of = |tags: &TagList| -> u32 {
        let mut body = Vec::new();
        write_varint(&mut body, tags.len() as u64);
        for &(k, v) in tags {
            match k {
                TagKey::Global(code) => write_varint(&mut body, (code as u64) << 1),
                TagKey::Local(i) => {
                    write_varint(&mut body, ((remap[i as usize] as u64) << 1) | 1)
                }
            }
            match v {
                TagValue::Global(code) => write_varint(&mut body, (code as u64) << 2),
                TagValue::Local(i) => {
                    write_varint(&mut body, ((remap[i as usize] as u64) << 2) | 1)
                }
                TagValue::Narrow(n) => write_varint(&mut body, ((n as u64) << 2) | 2),
            }
        }
        if let Some(&idx) = tag_tables.get(&body) {
            return idx;
        }
        let idx = tag_bodies.len() as u32;
        tag_tables.insert(body.clone(), idx);
        tag_bodies.push(body);
        idx
    };

    // feature records
    let mut records: Vec<Vec<u8>> = Vec::with_capacity(order.len());
    let mut union_bounds = Bbox::empty();
    for &f in &order {
        let mut rec = Vec::new();
        match f {
            FeatRef::Node(i) => {
                let node = &model.nodes[i as usize];
                union_bounds.expand_to_include(node.xy);
                let mut flags = 0;
                if node.orphan {
                    flags |= FLAG_ORPHAN;
                }
                if node.shared_location {
                    flags |= FLAG_SHARED;
                }
                if !node.tags.is_empty() {
                    flags |= FLAG_TAGS;
                }
                let parents = resolve_parents(&node.parents, &tex_of_parent);
                if !parents.is_empty() {
                    flags |= FLAG_PARENTS;
                }
                write_varint(&mut rec, node.id);
                write_varint(&mut rec, flags);
                write_signed_varint(&mut rec, node.xy.x as i64);
                write_signed_varint(&mut rec, node.xy.y as i64);
                if flags & FLAG_TAGS != 0 {
                    write_varint(&mut rec, table_of(&node.tags) as u64);
                }
                write_parents(&mut rec, flags, &parents);
            }
            FeatRef::Way(i) => {
                let way = &model.ways[i as usize];
                union_bounds.expand_to_include_box(&way.bounds);
                let mut flags = 0;
                if way.is_area {
                    flags |= FLAG_AREA;
                }
                if way.closed_ring {
                    flags |= FLAG_RING;
                }
                if !way.tags.is_empty() {
                    flags |= FLAG_TAGS;
                }
                if include_waynode_ids {
                    flags |= FLAG_WAYNODE_IDS;
                }
                let parents = resolve_parents(&way.parents, &tex_of_parent);
                if !parents.is_empty() {
                    flags |= FLAG_PARENTS;
                }
                write_varint(&mut rec, way.id);
                write_varint(&mut rec, flags);
                write_bbox(&mut rec, &way.bounds);
                if flags & FLAG_TAGS != 0 {
                    write_varint(&mut rec, table_of(&way.tags) as u64);
                }
                write_varint(&mut rec, way.coords.len() as u64);
                let mut px = way.bounds.min_x() as i64;
                let mut py = way.bounds.min_y() as i64;
                for c in &way.coords {
                    write_signed_varint(&mut rec, c.x as i64 - px);
                    write_signed_varint(&mut rec, c.y as i64 - py);
                    px = c.x as i64;
                    py = c.y as i64;
                }
                if flags & FLAG_WAYNODE_IDS != 0 {
                    write_varint(&mut rec, way.node_ids.len() as u64);
                    let mut prev = 0i64;
                    for &id in &way.node_ids {
                        write_signed_varint(&mut rec, id - prev);
                        prev = id;
                    }
                }
                write_parents(&mut rec, flags, &parents);
            }
            FeatRef::Relation(i) => {
                let rel = &model.relations[i as usize];
                union_bounds.expand_to_include_box(&rel.bounds);
                let mut flags = 0;
                if rel.is_area {
                    flags |= FLAG_AREA;
                }
                if !rel.tags.is_empty() {
                    flags |= FLAG_TAGS;
                }
                let parents = resolve_parents(&rel.parents, &tex_of_parent);
                if !parents.is_empty() {
                    flags |= FLAG_PARENTS;
                }
                write_varint(&mut rec, rel.id);
                write_varint(&mut rec, flags);
                write_bbox(&mut rec, &rel.bounds);
                if flags & FLAG_TAGS != 0 {
                    write_varint(&mut rec, table_of(&rel.tags) as u64);
                }
                let members: Vec<&super::model::CompMember> = rel
                    .members
                    .iter()
                    .filter(|m| match m.mref {
                        MemberRef::Local { typed_id } => {
                            // every local member is itself a serialized
                            // feature; anything else is an upstream bug
                            let known = seq_of.contains_key(&typed_id);
                            debug_assert!(known, "unserialized local member");
                            known
                        }
                        MemberRef::Foreign { .. } => true,
                    })
                    .collect();
                write_varint(&mut rec, members.len() as u64);
                for m in members {
                    match m.mref {
                        MemberRef::Local { typed_id } => {
                            let ftype = TypedFeatureId::from_raw(typed_id).ftype();
                            write_varint(&mut rec, ftype.code() as u64);
                            write_varint(&mut rec, seq_of[&typed_id] as u64);
                        }
                        MemberRef::Foreign { ftype, pile, tex } => {
                            write_varint(&mut rec, ftype.code() as u64 | 4);
                            write_varint(&mut rec, pile as u64);
                            write_varint(&mut rec, tex as u64);
                        }
                    }
                    match m.role {
                        TagValue::Global(code) => write_varint(&mut rec, (code as u64) << 1),
                        TagValue::Local(i) => {
                            write_varint(&mut rec, ((remap[i as usize] as u64) << 1) | 1)
                        }
                        TagValue::Narrow(_) => unreachable!("roles are never numbers"),
                    }
                }
                write_parents(&mut rec, flags, &parents);
            }
        }
        records.push(rec);
    }

    write_varint(&mut tag_section, tag_bodies.len() as u64);
    for body in &tag_bodies {
        tag_section.extend_from_slice(body);
    }

    let mut features_section = Vec::new();
    write_varint(&mut features_section, records.len() as u64);
    let offsets_start = features_section.len();
    features_section.resize(offsets_start + records.len() * 4, 0);
    let records_start = features_section.len();
    for (i, rec) in records.iter().enumerate() {
        let ofs = (features_section.len() - records_start) as u32;
        features_section[offsets_start + i * 4..offsets_start + i * 4 + 4]
            .copy_from_slice(&ofs.to_le_bytes());
        features_section.extend_from_slice(rec);
    }

    let node_index = serialize_index(&indexes.nodes, 0);
    let way_index = serialize_index(&indexes.ways, indexes.nodes.feature_count());
    let area_index = serialize_index(
        &indexes.areas,
        indexes.nodes.feature_count() + indexes.ways.feature_count(),
    );
    let rel_index = serialize_index(
        &indexes.relations,
        indexes.nodes.feature_count()
            + indexes.ways.feature_count()
            + indexes.areas.feature_count(),
    );

    let mut exports_section = Vec::new();
    write_varint(&mut exports_section, model.exports.len() as u64);
    for e in &model.exports {
        exports_section.extend_from_slice(&e.raw().to_le_bytes());
    }

    // assemble
    let mut blob = vec![0u8; HEADER_LEN];
    let strings_ofs = append_section(&mut blob, strings_section);
    let tags_ofs = append_section(&mut blob, tag_section);
    let features_ofs = append_section(&mut blob, features_section);
    let node_ofs = append_section(&mut blob, node_index);
    let way_ofs = append_section(&mut blob, way_index);
    let area_ofs = append_section(&mut blob, area_index);
    let rel_ofs = append_section(&mut blob, rel_index);
    let exports_ofs = append_section(&mut blob, exports_section);

    blob[0..4].copy_from_slice(&TILE_MAGIC.to_le_bytes());
    let b = if union_bounds.is_empty() { Bbox::new(0, 0, 0, 0) } else { union_bounds };
    blob[4..8].copy_from_slice(&b.min_x().to_le_bytes());
    blob[8..12].copy_from_slice(&b.min_y().to_le_bytes());
    blob[12..16].copy_from_slice(&b.max_x().to_le_bytes());
    blob[16..20].copy_from_slice(&b.max_y().to_le_bytes());
    for (pos, val) in [
        (20, strings_ofs),
        (24, tags_ofs),
        (28, features_ofs),
        (32, node_ofs),
        (36, way_ofs),
        (40, area_ofs),
        (44, rel_ofs),
        (48, exports_ofs),
        (52, records.len() as u32),
        (56, blob.len() as u32),
    ] {
        blob[pos..pos + 4].copy_from_slice(&val.to_le_bytes());
    }
    blob
}

/// Structural validation used by the `check` command: magic, recorded
/// length, and section offsets all inside the blob.
pub fn check_tile_blob(blob: &[u8], raw_len: u32) -> anyhow::Result<()> {
    use anyhow::ensure;
    ensure!(blob.len() == raw_len as usize, "tile length mismatch");
    ensure!(blob.len() >= HEADER_LEN, "tile too short");
    let magic = u32::from_le_bytes(blob[0..4].try_into().unwrap());
    ensure!(magic == TILE_MAGIC, "bad tile magic");
    let recorded = u32::from_le_bytes(blob[56..60].try_into().unwrap());
    ensure!(recorded as usize == blob.len(), "tile header length mismatch");
    for pos in [20usize, 24, 28, 32, 36, 40, 44, 48] {
        let ofs = u32::from_le_bytes(blob[pos..pos + 4].try_into().unwrap());
        ensure!(
            (HEADER_LEN..=blob.len()).contains(&(ofs as usize)),
            "tile section offset out of range"
        );
    }
    let min_x = i32::from_le_bytes(blob[4..8].try_into().unwrap());
    let max_x = i32::from_le_bytes(blob[12..16].try_into().unwrap());
    ensure!(min_x <= max_x, "inverted tile bounds");
    Ok(())
}

fn append_section(blob: &mut Vec<u8>, section: Vec<u8>) -> u32 {
    let ofs = blob.len() as u32;
    blob.extend_from_slice(&section);
    ofs
}

fn resolve_parents(
    parents: &[super::model::ForeignParent],
    tex_of_parent: &impl Fn(u32, u64) -> Option<u32>,
) -> Vec<(u32, u32)> {
    parents
        .iter()
        .filter_map(|p| tex_of_parent(p.pile, p.rel_id).map(|tex| (p.pile, tex)))
        .collect()
}

fn write_parents(rec: &mut Vec<u8>, flags: u64, parents: &[(u32, u32)]) {
    if flags & FLAG_PARENTS != 0 {
        write_varint(rec, parents.len() as u64);
        for &(pile, tex) in parents {
            write_varint(rec, pile as u64);
            write_varint(rec, tex as u64);
        }
    }
}

fn write_bbox(rec: &mut Vec<u8>, bounds: &Bbox) {
    let b = if bounds.is_empty() { Bbox::new(0, 0, 0, 0) } else { *bounds };
    write_signed_varint(rec, b.min_x() as i64);
    write_signed_varint(rec, b.min_y() as i64);
    write_varint(rec, (b.max_x() as i64 - b.min_x() as i64) as u64);
    write_varint(rec, (b.max_y() as i64 - b.min_y() as i64) as u64);
}

fn serialize_index(index: &SpatialIndex, first_seq: usize) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, index.sub_indexes.len() as u64);
    let mut seq = first_seq as u64;
    for sub in &index.sub_indexes {
        write_varint(&mut out, sub.category as u64);
        write_varint(&mut out, seq);
        write_varint(&mut out, sub.items.len() as u64);
        write_varint(&mut out, sub.branches.len() as u64);
        for branch in &sub.branches {
            let b = if branch.bounds.is_empty() {
                Bbox::new(0, 0, 0, 0)
            } else {
                branch.bounds
            };
            out.extend_from_slice(&b.min_x().to_le_bytes());
            out.extend_from_slice(&b.min_y().to_le_bytes());
            out.extend_from_slice(&b.max_x().to_le_bytes());
            out.extend_from_slice(&b.max_y().to_le_bytes());
            out.extend_from_slice(&branch.key_bits.to_le_bytes());
            write_varint(&mut out, branch.first as u64);
            write_varint(&mut out, branch.count as u64);
        }
        seq += sub.items.len() as u64;
    }
    out
}
