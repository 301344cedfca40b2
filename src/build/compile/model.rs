//! The compiler's in-memory tile model: pile records resolved into
//! features with string-resolved tags, authoritative bounding boxes and
//! parent back-references.

use ahash::AHashMap;

use crate::build::proto::{
    read_proto_string, read_tile, Locator, StrKind, TileSink, SPECIAL_ORPHAN, SPECIAL_SHARED,
};
use crate::build::strings::StringCatalog;
use crate::common::varint::Cursor;
use crate::feature::{FeatureType, TypedFeatureId};
use crate::geom::{Bbox, Coordinate};

/// A tag key: a global-string code or an index into the tile's own
/// string table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TagKey {
    Global(u16),
    Local(u32),
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TagValue {
    Global(u16),
    Local(u32),
    /// canonical integers in `-256..=65279`, stored as number + 256
    Narrow(u32),
}

pub type TagList = Vec<(TagKey, TagValue)>;

/// A member reference: another feature in this tile, or a feature in a
/// foreign tile addressed by (pile, TEX).
#[derive(Copy, Clone, Debug)]
pub enum MemberRef {
    Local { typed_id: u64 },
    Foreign { ftype: FeatureType, pile: u32, tex: u32 },
}

pub struct CompMember {
    pub mref: MemberRef,
    pub role: TagValue,
}

/// A parent relation living in a foreign tile.
#[derive(Copy, Clone, Debug)]
pub struct ForeignParent {
    pub pile: u32,
    pub rel_id: u64,
}

pub struct CompNode {
    pub id: u64,
    pub xy: Coordinate,
    pub tags: TagList,
    pub is_feature: bool,
    pub orphan: bool,
    pub shared_location: bool,
    pub parents: Vec<ForeignParent>,
}

pub struct CompWay {
    pub id: u64,
    pub node_ids: Vec<i64>,
    /// resolved coordinates, missing nodes dropped
    pub coords: Vec<Coordinate>,
    pub tags: TagList,
    pub closed_ring: bool,
    pub is_area: bool,
    pub bounds: Bbox,
    pub parents: Vec<ForeignParent>,
}

pub struct CompRelation {
    pub id: u64,
    pub members: Vec<CompMember>,
    pub tags: TagList,
    pub is_area: bool,
    pub bounds: Bbox,
    pub parents: Vec<ForeignParent>,
}

#[derive(Default)]
pub struct CompModel {
    pub nodes: Vec<CompNode>,
    pub ways: Vec<CompWay>,
    pub relations: Vec<CompRelation>,
    /// the tile's own string table, in first-use order (re-sorted later)
    pub local_strings: Vec<String>,
    pub exports: Vec<TypedFeatureId>,
    string_lookup: AHashMap<String, u32>,
    node_slots: AHashMap<u64, u32>,
    foreign_node_coords: AHashMap<u64, Coordinate>,
    /// typed id -> (bounds, tex, source pile)
    foreign_bounds: AHashMap<u64, (Bbox, u32, u32)>,
    /// node id -> (tex, source pile)
    foreign_node_tex: AHashMap<u64, (u32, u32)>,
}

impl CompModel {
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_lookup.get(s) {
            return idx;
        }
        let idx = self.local_strings.len() as u32;
        self.local_strings.push(s.to_string());
        self.string_lookup.insert(s.to_string(), idx);
        idx
    }


    fn value_for(&mut self, global: Option<u16>, s: &str) -> TagValue {
        if let Some(code) = global {
            return TagValue::Global(code);
        }
        if let Some(n) = parse_narrow(s) {
            return TagValue::Narrow(n);
        }
        TagValue::Local(self.intern(s))
    }

    fn key_for(&mut self, global: Option<u16>, s: &str) -> TagKey {
        match global {
            Some(code) => TagKey::Global(code),
            None => TagKey::Local(self.intern(s)),
        }
    }
}

/// Canonical narrow integer parse; mirrors the catalog's exclusion rule.
fn parse_narrow(s: &str) -> Option<u32> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || digits.len() > 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    let v: i64 = digits.parse().ok()?;
    let v = if neg { -v } else { v };
    if (-256..=65279).contains(&v) {
        Some((v + 256) as u32)
    } else {
        None
    }
}

/// First pass over the pile: collect raw records.
struct RawFeature {
    id: u64,
    body: (u32, u32),
    locator: Locator,
}

#[derive(Default)]
struct RawTile {
    nodes: Vec<(u64, Coordinate, (u32, u32))>,
    ways: Vec<RawFeature>,
    relations: Vec<RawFeature>,
    memberships: Vec<(u64, Locator, TypedFeatureId)>,
    specials: Vec<(u64, u32)>,
    foreign_nodes: Vec<(u32, u64, Coordinate, Option<u32>)>,
    foreign_features: Vec<(u32, FeatureType, u64, Bbox, u32)>,
    exports: Vec<TypedFeatureId>,
}

struct RawBuilder<'a> {
    data: &'a [u8],
    raw: RawTile,
}

impl RawBuilder<'_> {
    fn range(&self, body: &[u8]) -> (u32, u32) {
        let ofs = body.as_ptr() as usize - self.data.as_ptr() as usize;
        (ofs as u32, body.len() as u32)
    }
}

impl TileSink for RawBuilder<'_> {
    fn node(&mut self, id: u64, xy: Coordinate, tags: &[u8]) {
        let range = self.range(tags);
        self.raw.nodes.push((id, xy, range));
    }
    fn way(&mut self, id: u64, locator: Locator, body: &[u8]) {
        if locator.zoom_delta() > 0 {
            return; // ghost ways carry nothing the compiler needs
        }
        let body = self.range(body);
        self.raw.ways.push(RawFeature { id, body, locator });
    }
    fn relation(&mut self, id: u64, locator: Locator, body: &[u8]) {
        let body = self.range(body);
        self.raw.relations.push(RawFeature { id, body, locator });
    }
    fn membership(&mut self, rel_id: u64, locator: Locator, member: TypedFeatureId) {
        self.raw.memberships.push((rel_id, locator, member));
    }
    fn foreign_node(&mut self, source_pile: u32, id: u64, xy: Coordinate, tex: Option<u32>) {
        self.raw.foreign_nodes.push((source_pile, id, xy, tex));
    }
    fn foreign_feature(
        &mut self,
        source_pile: u32,
        ftype: FeatureType,
        id: u64,
        bounds: Bbox,
        tex: u32,
    ) {
        self.raw.foreign_features.push((source_pile, ftype, id, bounds, tex));
    }
    fn special_node(&mut self, id: u64, flags: u32) {
        self.raw.specials.push((id, flags));
    }
    fn export_table(&mut self, entries: &[TypedFeatureId]) {
        self.raw.exports.extend_from_slice(entries);
    }
}

/// Build the full model for one tile.
pub fn build_model(data: &[u8], strings: &StringCatalog) -> CompModel {
    let mut builder = RawBuilder { data, raw: RawTile::default() };
    read_tile(data, &mut builder);
    let raw = builder.raw;

    let mut model = CompModel::default();
    model.exports = raw.exports;

    let mut specials: AHashMap<u64, u32> = AHashMap::with_capacity(raw.specials.len());
    for (id, flags) in raw.specials {
        specials.insert(id, flags);
    }
    for (pile, id, xy, tex) in &raw.foreign_nodes {
        model.foreign_node_coords.insert(*id, *xy);
        if let Some(tex) = tex {
            model.foreign_node_tex.insert(*id, (*tex, *pile));
        }
    }
    for (pile, ftype, id, bounds, tex) in &raw.foreign_features {
        let typed = TypedFeatureId::new(*ftype, *id).raw();
        // a record with bounds wins over an incomplete one
        let entry = model.foreign_bounds.entry(typed).or_insert((*bounds, *tex, *pile));
        if entry.0.is_empty() && !bounds.is_empty() {
            *entry = (*bounds, *tex, *pile);
        }
    }

    // local nodes
    for (ni, &(id, xy, (tofs, tlen))) in raw.nodes.iter().enumerate() {
        let tags = decode_tags(&data[tofs as usize..(tofs + tlen) as usize], strings, &mut model);
        let special = specials.get(&id).copied();
        let node = CompNode {
            id,
            xy,
            is_feature: !tags.is_empty() || special.is_some(),
            orphan: special.is_some_and(|f| f & SPECIAL_ORPHAN != 0),
            shared_location: special.is_some_and(|f| f & SPECIAL_SHARED != 0),
            tags,
            parents: Vec::new(),
        };
        model.nodes.push(node);
        model.node_slots.insert(id, ni as u32);
    }

    // local ways
    for rw in &raw.ways {
        let (ofs, len) = rw.body;
        let mut c = Cursor::new(&data[ofs as usize..(ofs + len) as usize]);
        let tagged_count = c.read_varint();
        let closed_ring = tagged_count & 1 != 0;
        let count = (tagged_count >> 1) as usize;
        let mut node_ids = Vec::with_capacity(count);
        let mut coords = Vec::with_capacity(count);
        let mut bounds = Bbox::empty();
        let mut node_id = 0i64;
        for _ in 0..count {
            node_id += c.read_signed_varint();
            node_ids.push(node_id);
            let xy = match model.node_slots.get(&(node_id as u64)) {
                Some(&slot) => Some(model.nodes[slot as usize].xy),
                None => model.foreign_node_coords.get(&(node_id as u64)).copied(),
            };
            if let Some(xy) = xy {
                coords.push(xy);
                bounds.expand_to_include(xy);
            }
        }
        let tags = decode_tag_stream(&mut c, strings, &mut model);
        model.ways.push(CompWay {
            id: rw.id,
            node_ids,
            coords,
            tags,
            closed_ring,
            is_area: false, // classified later
            bounds,
            parents: Vec::new(),
        });
    }

    // local relations (children precede parents in pile order, so bounds
    // of local relation members are complete when the parent reads them)
    let way_slots: AHashMap<u64, u32> = model
        .ways
        .iter()
        .enumerate()
        .map(|(i, w)| (w.id, i as u32))
        .collect();
    let mut rel_slots: AHashMap<u64, u32> = AHashMap::new();
    for rr in &raw.relations {
        let (ofs, len) = rr.body;
        let mut c = Cursor::new(&data[ofs as usize..(ofs + len) as usize]);
        let member_count = c.read_varint();
        let mut members = Vec::with_capacity(member_count as usize);
        let mut bounds = Bbox::empty();
        for _ in 0..member_count {
            let typed = c.read_varint();
            let (role_code, role_str) = read_proto_string(&mut c, StrKind::Role, strings);
            if typed == 0 {
                continue;
            }
            let tid = TypedFeatureId::from_raw(typed);
            let role = match role_code {
                Some(code) => TagValue::Global(code),
                None => TagValue::Local(model.intern(role_str)),
            };
            let mref = match tid.ftype() {
                FeatureType::Node => {
                    if let Some(&slot) = model.node_slots.get(&tid.id()) {
                        bounds.expand_to_include(model.nodes[slot as usize].xy);
                        Some(MemberRef::Local { typed_id: typed })
                    } else if let Some(&xy) = model.foreign_node_coords.get(&tid.id()) {
                        bounds.expand_to_include(xy);
                        model.foreign_node_tex.get(&tid.id()).map(|&(tex, pile)| {
                            MemberRef::Foreign { ftype: FeatureType::Node, pile, tex }
                        })
                    } else {
                        None
                    }
                }
                FeatureType::Way => {
                    if let Some(&slot) = way_slots.get(&tid.id()) {
                        bounds.expand_to_include_box(&model.ways[slot as usize].bounds);
                        Some(MemberRef::Local { typed_id: typed })
                    } else {
                        model.foreign_bounds.get(&typed).map(|&(b, tex, pile)| {
                            bounds.expand_to_include_box(&b);
                            MemberRef::Foreign { ftype: FeatureType::Way, pile, tex }
                        })
                    }
                }
                FeatureType::Relation => {
                    if let Some(&slot) = rel_slots.get(&tid.id()) {
                        bounds.expand_to_include_box(&model.relations[slot as usize].bounds);
                        Some(MemberRef::Local { typed_id: typed })
                    } else {
                        model.foreign_bounds.get(&typed).map(|&(b, tex, pile)| {
                            bounds.expand_to_include_box(&b);
                            MemberRef::Foreign { ftype: FeatureType::Relation, pile, tex }
                        })
                    }
                }
            };
            if let Some(mref) = mref {
                members.push(CompMember { mref, role });
            }
        }
        let tags = decode_tag_stream(&mut c, strings, &mut model);
        rel_slots.insert(rr.id, model.relations.len() as u32);
        model.relations.push(CompRelation {
            id: rr.id,
            members,
            tags,
            is_area: false,
            bounds,
            parents: Vec::new(),
        });
    }

    // foreign parent back-references
    for (rel_id, locator, member) in &raw.memberships {
        let parent = ForeignParent { pile: locator_parent_marker(*locator), rel_id: *rel_id };
        match member.ftype() {
            FeatureType::Node => {
                if let Some(&slot) = model.node_slots.get(&member.id()) {
                    let node = &mut model.nodes[slot as usize];
                    node.is_feature = true;
                    node.parents.push(parent);
                }
            }
            FeatureType::Way => {
                if let Some(&slot) = way_slots.get(&member.id()) {
                    model.ways[slot as usize].parents.push(parent);
                }
            }
            FeatureType::Relation => {
                if let Some(&slot) = rel_slots.get(&member.id()) {
                    model.relations[slot as usize].parents.push(parent);
                }
            }
        }
    }

    model
}

/// Memberships address the parent's tile relative to this one; the
/// compiler resolves this marker to a pile once it knows the tile.
/// Encoded as `(zoom_delta << 3) | twin_code` to stay self-contained.
fn locator_parent_marker(locator: Locator) -> u32 {
    (locator.zoom_delta() << 3) | locator.twin_code()
}

pub fn parent_marker_parts(marker: u32) -> (u32, u32) {
    (marker >> 3, marker & 7)
}

fn decode_tags<'a>(tags: &'a [u8], strings: &'a StringCatalog, model: &mut CompModel) -> TagList {
    let mut c = Cursor::new(tags);
    decode_tag_stream(&mut c, strings, model)
}

fn decode_tag_stream<'a>(
    c: &mut Cursor<'a>,
    strings: &'a StringCatalog,
    model: &mut CompModel,
) -> TagList {
    let mut tags = TagList::new();
    while !c.is_empty() {
        let (kg, ks) = read_proto_string(c, StrKind::Key, strings);
        let (vg, vs) = read_proto_string(c, StrKind::Value, strings);
        let key = model.key_for(kg, ks);
        let value = model.value_for(vg, vs);
        tags.push((key, value));
    }
    tags
}
