//! Proto-GOL: the intermediate per-tile encoding written during sort and
//! validate and consumed by validate and compile.
//!
//! A pile's byte stream is a sequence of groups. Each group starts with a
//! marker byte `(feature_type << 3) | kind` and ends with a zero byte.
//! Within a group, feature ids are delta-encoded against the previous
//! record of the same group instance, with the low bit(s) of the delta
//! word carrying per-record flags:
//!
//! * local node:      `(Δid << 1) | has_tags`, Δx, Δy, `[tags_len, tags]`
//! * local way:       `(Δid << 1) | multi_tile`, `[locator]`, body_len, body
//! * local relation:  `(Δid << 1) | 0`, locator, body_len, body
//! * membership:      `(Δid << 1) | 1`, locator, typed member id
//! * foreign node:    `(zigzag Δid << 1) | has_tex`, `[tex]`, Δx, Δy
//! * foreign feature: `(zigzag Δid << 1) | has_bounds`, tex, `[bounds]`
//! * special node:    `(Δid << 2) | flags`
//!
//! Foreign groups carry the source pile as a varint right after the
//! marker byte. A way body is `tagged_node_count` (node count shifted left
//! with the closed-ring bit), the node-id deltas, then tag bytes. A
//! relation body is `member_count`, then per member a typed id and a role
//! string, then tag bytes.
//!
//! Tag bytes alternate key and value proto-strings: either a varint
//! `(proto_code << 1) | 1` or an inline literal `(len << 1)` + bytes.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::build::strings::{StringCatalog, StringRef};
use crate::common::varint::{
    unzigzag, varint_len, write_signed_varint, write_varint, zigzag, Cursor,
};
use crate::feature::{FeatureType, TypedFeatureId};
use crate::geom::{Bbox, Coordinate};

pub const GROUP_LOCAL: u8 = 1;
pub const GROUP_EXPORTED: u8 = 2;
pub const GROUP_SPECIAL: u8 = 3;
pub const GROUP_EXPORT_TABLE: u8 = 4;

pub const LOCAL_NODES: u8 = GROUP_LOCAL;
pub const LOCAL_WAYS: u8 = (1 << 3) | GROUP_LOCAL;
pub const LOCAL_RELATIONS: u8 = (2 << 3) | GROUP_LOCAL;
pub const EXPORTED_NODES: u8 = GROUP_EXPORTED;
pub const SPECIAL_NODES: u8 = GROUP_SPECIAL;
pub const EXPORT_TABLE: u8 = GROUP_EXPORT_TABLE;

pub const SPECIAL_SHARED: u32 = 1;
pub const SPECIAL_ORPHAN: u32 = 2;

pub fn exported_group(ftype: FeatureType) -> u8 {
    ((ftype.code() as u8) << 3) | GROUP_EXPORTED
}

/// Locates a feature's own (pair) tile relative to the tile a record was
/// written into: `(twin_code << 4) | zoom_delta`. An empty locator means
/// "lives exactly here, no twin". For relations, a zoom delta of 1 is
/// repurposed as the "always export" flag.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct Locator(u8);

impl Locator {
    pub fn new(twin_code: u32, zoom_delta: u32) -> Locator {
        debug_assert!(twin_code <= 4 && zoom_delta <= 12);
        Locator(((twin_code as u8) << 4) | zoom_delta as u8)
    }

    pub fn from_byte(b: u8) -> Locator {
        Locator(b)
    }

    pub fn byte(self) -> u8 {
        self.0
    }

    pub fn zoom_delta(self) -> u32 {
        (self.0 & 15) as u32
    }

    pub fn twin_code(self) -> u32 {
        (self.0 >> 4) as u32
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with_export_flag(self, flag: bool) -> Locator {
        Locator(self.0 | flag as u8)
    }
}

// ---------------------------------------------------------------------
// Writing: in-memory pile batches

struct PileBuf {
    number: u32,
    data: Vec<u8>,
    open_group: Option<u8>,
    prev_id: u64,
    prev_coord: Coordinate,
}

/// A batch of pile appends assembled in memory by one worker and handed
/// to the output thread, which writes it into the pile file.
#[derive(Default)]
pub struct PileTray {
    bufs: Vec<PileBuf>,
    by_pile: AHashMap<u32, u32>,
}

impl PileTray {
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn open(&mut self, pile: u32, group: u8, source_pile: Option<u32>) -> &mut PileBuf {
        debug_assert!(pile >= 1);
        let idx = match self.by_pile.get(&pile) {
            Some(&i) => i as usize,
            None => {
                self.bufs.push(PileBuf {
                    number: pile,
                    data: Vec::with_capacity(256),
                    open_group: None,
                    prev_id: 0,
                    prev_coord: Coordinate::default(),
                });
                self.by_pile.insert(pile, self.bufs.len() as u32 - 1);
                self.bufs.len() - 1
            }
        };
        let buf = &mut self.bufs[idx];
        match buf.open_group {
            Some(g) => debug_assert_eq!(g, group, "group switch without close"),
            None => {
                buf.data.push(group);
                if let Some(src) = source_pile {
                    write_varint(&mut buf.data, src as u64);
                }
                buf.open_group = Some(group);
                buf.prev_id = 0;
                buf.prev_coord = Coordinate::default();
            }
        }
        buf
    }

    /// Terminate all open groups. Buffered data stays until `drain`.
    pub fn close_groups(&mut self) {
        for buf in &mut self.bufs {
            if buf.open_group.take().is_some() {
                buf.data.push(0);
            }
        }
    }

    /// Hand off all buffered (pile, bytes) batches, closing open groups.
    pub fn drain(&mut self) -> Vec<(u32, Vec<u8>)> {
        self.close_groups();
        self.by_pile.clear();
        self.bufs.drain(..).map(|b| (b.number, b.data)).collect()
    }

    pub fn write_node(&mut self, pile: u32, id: u64, xy: Coordinate, tags: &[u8]) {
        let buf = self.open(pile, LOCAL_NODES, None);
        debug_assert!(id > buf.prev_id || buf.prev_id == 0);
        write_varint(&mut buf.data, ((id - buf.prev_id) << 1) | (!tags.is_empty()) as u64);
        write_signed_varint(&mut buf.data, xy.x as i64 - buf.prev_coord.x as i64);
        write_signed_varint(&mut buf.data, xy.y as i64 - buf.prev_coord.y as i64);
        if !tags.is_empty() {
            write_varint(&mut buf.data, tags.len() as u64);
            buf.data.extend_from_slice(tags);
        }
        buf.prev_id = id;
        buf.prev_coord = xy;
    }

    /// `nodes` holds the pre-encoded node-id deltas; `tagged_node_count`
    /// is `(count << 1) | closed_ring`.
    pub fn write_way(
        &mut self,
        pile: u32,
        id: u64,
        locator: Locator,
        tagged_node_count: u32,
        nodes: &[u8],
        tags: &[u8],
    ) {
        let buf = self.open(pile, LOCAL_WAYS, None);
        debug_assert!(id > buf.prev_id || buf.prev_id == 0);
        write_varint(&mut buf.data, ((id - buf.prev_id) << 1) | (!locator.is_empty()) as u64);
        if !locator.is_empty() {
            buf.data.push(locator.byte());
        }
        let body_len = varint_len(tagged_node_count as u64) + nodes.len() + tags.len();
        write_varint(&mut buf.data, body_len as u64);
        write_varint(&mut buf.data, tagged_node_count as u64);
        buf.data.extend_from_slice(nodes);
        buf.data.extend_from_slice(tags);
        buf.prev_id = id;
    }

    /// `body` holds members and tags; `extra_tags` carries the synthetic
    /// `geodesk:` annotations.
    pub fn write_relation(
        &mut self,
        pile: u32,
        id: u64,
        locator: Locator,
        member_count: u32,
        body: &[u8],
        extra_tags: &[u8],
    ) {
        let buf = self.open(pile, LOCAL_RELATIONS, None);
        debug_assert!(id > buf.prev_id || buf.prev_id == 0);
        write_varint(&mut buf.data, (id - buf.prev_id) << 1);
        buf.data.push(locator.byte());
        let body_len = varint_len(member_count as u64) + body.len() + extra_tags.len();
        write_varint(&mut buf.data, body_len as u64);
        write_varint(&mut buf.data, member_count as u64);
        buf.data.extend_from_slice(body);
        buf.data.extend_from_slice(extra_tags);
        buf.prev_id = id;
    }

    pub fn write_membership(
        &mut self,
        pile: u32,
        rel_id: u64,
        locator: Locator,
        member: TypedFeatureId,
    ) {
        let buf = self.open(pile, LOCAL_RELATIONS, None);
        debug_assert!(rel_id >= buf.prev_id);
        write_varint(&mut buf.data, ((rel_id - buf.prev_id) << 1) | 1);
        buf.data.push(locator.byte());
        write_varint(&mut buf.data, member.raw());
        buf.prev_id = rel_id;
    }

    pub fn write_foreign_node(
        &mut self,
        pile: u32,
        source_pile: u32,
        id: u64,
        xy: Coordinate,
        tex: Option<u32>,
    ) {
        let buf = self.open(pile, EXPORTED_NODES, Some(source_pile));
        debug_assert!(id != buf.prev_id || buf.prev_id == 0);
        let delta = zigzag(id as i64 - buf.prev_id as i64);
        write_varint(&mut buf.data, (delta << 1) | tex.is_some() as u64);
        if let Some(tex) = tex {
            write_varint(&mut buf.data, tex as u64);
        }
        write_signed_varint(&mut buf.data, xy.x as i64 - buf.prev_coord.x as i64);
        write_signed_varint(&mut buf.data, xy.y as i64 - buf.prev_coord.y as i64);
        buf.prev_id = id;
        buf.prev_coord = xy;
    }

    /// An empty `bounds` means "bounds incomplete, deliver them on the odd
    /// pass" for multi-tile features.
    pub fn write_foreign_feature(
        &mut self,
        pile: u32,
        source_pile: u32,
        ftype: FeatureType,
        id: u64,
        bounds: &Bbox,
        tex: u32,
    ) {
        let buf = self.open(pile, exported_group(ftype), Some(source_pile));
        debug_assert!(id != buf.prev_id || buf.prev_id == 0);
        let delta = zigzag(id as i64 - buf.prev_id as i64);
        write_varint(&mut buf.data, (delta << 1) | (!bounds.is_empty()) as u64);
        write_varint(&mut buf.data, tex as u64);
        if !bounds.is_empty() {
            write_signed_varint(&mut buf.data, bounds.min_x() as i64 - buf.prev_coord.x as i64);
            write_signed_varint(&mut buf.data, bounds.min_y() as i64 - buf.prev_coord.y as i64);
            write_varint(&mut buf.data, (bounds.max_x() as i64 - bounds.min_x() as i64) as u64);
            write_varint(&mut buf.data, (bounds.max_y() as i64 - bounds.min_y() as i64) as u64);
            buf.prev_coord = Coordinate::new(bounds.min_x(), bounds.min_y());
        }
        buf.prev_id = id;
    }

    /// Flags may be zero: an untagged relation-member node is special
    /// without being shared or orphaned.
    pub fn write_special_node(&mut self, pile: u32, id: u64, flags: u32) {
        debug_assert!(flags <= 3);
        let buf = self.open(pile, SPECIAL_NODES, None);
        debug_assert!(id > buf.prev_id || buf.prev_id == 0);
        write_varint(&mut buf.data, ((id - buf.prev_id) << 2) | flags as u64);
        buf.prev_id = id;
    }

    /// Entries must already be sorted (Hilbert order); their position is
    /// the TEX other tiles will use.
    pub fn write_export_table(&mut self, pile: u32, entries: &[TypedFeatureId]) {
        let buf = self.open(pile, EXPORT_TABLE, None);
        write_varint(&mut buf.data, entries.len() as u64);
        let mut prev: i64 = 0;
        for e in entries {
            write_signed_varint(&mut buf.data, e.raw() as i64 - prev);
            prev = e.raw() as i64;
        }
    }
}

// ---------------------------------------------------------------------
// Tag encoding

/// Append one proto-string: a table code or an inline literal.
pub fn write_proto_string(out: &mut Vec<u8>, code: Option<u32>, literal: &str) {
    match code {
        Some(code) => write_varint(out, ((code as u64) << 1) | 1),
        None => {
            debug_assert!(literal.len() < (1 << 13), "literal string too long");
            write_varint(out, (literal.len() as u64) << 1);
            out.extend_from_slice(literal.as_bytes());
        }
    }
}

/// Which proto-string table a string was encoded against.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StrKind {
    Key,
    Value,
    Role,
}

/// Decode one proto-string into either a global-string code or a literal.
pub fn read_proto_string<'a>(
    c: &mut Cursor<'a>,
    kind: StrKind,
    catalog: &'a StringCatalog,
) -> (Option<u16>, &'a str) {
    let word = c.read_varint();
    if word & 1 != 0 {
        let code = (word >> 1) as u32;
        let sref = match kind {
            StrKind::Key => catalog.key_ref(code),
            StrKind::Value => catalog.value_ref(code),
            StrKind::Role => catalog.role_ref(code),
        };
        match sref {
            StringRef::Global(g) => (Some(g), catalog.global_string(g)),
            StringRef::Literal(_) => (None, catalog.resolve(sref)),
        }
    } else {
        let len = (word >> 1) as usize;
        let bytes = c.read_bytes(len);
        (None, std::str::from_utf8(bytes).expect("proto strings are UTF-8"))
    }
}

pub fn skip_proto_string(c: &mut Cursor) {
    let word = c.read_varint();
    if word & 1 == 0 {
        c.skip((word >> 1) as usize);
    }
}

// ---------------------------------------------------------------------
// Reading

/// Callbacks for one pile's groups. Implemented by the validator and the
/// compiler; unneeded callbacks default to no-ops.
pub trait TileSink {
    fn node(&mut self, _id: u64, _xy: Coordinate, _tags: &[u8]) {}
    fn way(&mut self, _id: u64, _locator: Locator, _body: &[u8]) {}
    fn relation(&mut self, _id: u64, _locator: Locator, _body: &[u8]) {}
    fn membership(&mut self, _rel_id: u64, _locator: Locator, _member: TypedFeatureId) {}
    fn foreign_node(&mut self, _source_pile: u32, _id: u64, _xy: Coordinate, _tex: Option<u32>) {}
    fn foreign_feature(
        &mut self,
        _source_pile: u32,
        _ftype: FeatureType,
        _id: u64,
        _bounds: Bbox,
        _tex: u32,
    ) {
    }
    fn special_node(&mut self, _id: u64, _flags: u32) {}
    fn export_table(&mut self, _entries: &[TypedFeatureId]) {}
}

/// Walk a pile's full byte stream, dispatching each group.
pub fn read_tile(data: &[u8], sink: &mut impl TileSink) {
    let mut c = Cursor::new(data);
    while !c.is_empty() {
        let marker = c.read_u8();
        let kind = marker & 7;
        let ftype = FeatureType::from_code((marker >> 3) as u32);
        match kind {
            GROUP_LOCAL => match ftype {
                FeatureType::Node => read_nodes(&mut c, sink),
                FeatureType::Way => read_ways(&mut c, sink),
                FeatureType::Relation => read_relations(&mut c, sink),
            },
            GROUP_EXPORTED => read_foreign(&mut c, ftype, sink),
            GROUP_SPECIAL => read_special_nodes(&mut c, sink),
            GROUP_EXPORT_TABLE => read_export_table(&mut c, sink),
            _ => unreachable!("bad group marker"),
        }
    }
}

fn read_nodes(c: &mut Cursor, sink: &mut impl TileSink) {
    let mut prev_id = 0u64;
    let mut xy = Coordinate::default();
    loop {
        let word = c.read_varint();
        if word == 0 {
            return;
        }
        let has_tags = word & 1 != 0;
        let id = prev_id + (word >> 1);
        prev_id = id;
        xy.x = (xy.x as i64 + c.read_signed_varint()) as i32;
        xy.y = (xy.y as i64 + c.read_signed_varint()) as i32;
        let tags = if has_tags {
            let len = c.read_varint() as usize;
            c.read_bytes(len)
        } else {
            &[]
        };
        sink.node(id, xy, tags);
    }
}

fn read_ways(c: &mut Cursor, sink: &mut impl TileSink) {
    let mut prev_id = 0u64;
    loop {
        let word = c.read_varint();
        if word == 0 {
            return;
        }
        let multi_tile = word & 1 != 0;
        let id = prev_id + (word >> 1);
        prev_id = id;
        let locator = if multi_tile {
            Locator::from_byte(c.read_u8())
        } else {
            Locator::default()
        };
        let len = c.read_varint() as usize;
        let body = c.read_bytes(len);
        sink.way(id, locator, body);
    }
}

fn read_relations(c: &mut Cursor, sink: &mut impl TileSink) {
    let mut prev_id = 0u64;
    loop {
        let word = c.read_varint();
        if word == 0 {
            return;
        }
        let is_membership = word & 1 != 0;
        let id = prev_id + (word >> 1);
        prev_id = id;
        let locator = Locator::from_byte(c.read_u8());
        if is_membership {
            sink.membership(id, locator, TypedFeatureId::from_raw(c.read_varint()));
        } else {
            let len = c.read_varint() as usize;
            let body = c.read_bytes(len);
            sink.relation(id, locator, body);
        }
    }
}

fn read_foreign(c: &mut Cursor, ftype: FeatureType, sink: &mut impl TileSink) {
    let source_pile = c.read_varint32();
    let mut prev_id = 0u64;
    let mut xy = Coordinate::default();
    loop {
        let word = c.read_varint();
        if word == 0 {
            return;
        }
        let flag = word & 1 != 0;
        let id = (prev_id as i64 + unzigzag(word >> 1)) as u64;
        prev_id = id;
        if ftype == FeatureType::Node {
            let tex = if flag { Some(c.read_varint32()) } else { None };
            xy.x = (xy.x as i64 + c.read_signed_varint()) as i32;
            xy.y = (xy.y as i64 + c.read_signed_varint()) as i32;
            sink.foreign_node(source_pile, id, xy, tex);
        } else {
            let tex = c.read_varint32();
            let mut bounds = Bbox::empty();
            if flag {
                xy.x = (xy.x as i64 + c.read_signed_varint()) as i32;
                xy.y = (xy.y as i64 + c.read_signed_varint()) as i32;
                let w = c.read_varint() as i64;
                let h = c.read_varint() as i64;
                bounds = Bbox::new(
                    xy.x,
                    xy.y,
                    (xy.x as i64 + w) as i32,
                    (xy.y as i64 + h) as i32,
                );
            }
            sink.foreign_feature(source_pile, ftype, id, bounds, tex);
        }
    }
}

fn read_special_nodes(c: &mut Cursor, sink: &mut impl TileSink) {
    let mut prev_id = 0u64;
    loop {
        let word = c.read_varint();
        if word == 0 {
            return;
        }
        let flags = (word & 3) as u32;
        let id = prev_id + (word >> 2);
        prev_id = id;
        sink.special_node(id, flags);
    }
}

fn read_export_table(c: &mut Cursor, sink: &mut impl TileSink) {
    let count = c.read_varint() as usize;
    let mut entries: SmallVec<[TypedFeatureId; 32]> = SmallVec::with_capacity(count);
    let mut prev: i64 = 0;
    for _ in 0..count {
        let raw = prev + c.read_signed_varint();
        entries.push(TypedFeatureId::from_raw(raw as u64));
        prev = raw;
    }
    sink.export_table(&entries);
    let terminator = c.read_u8();
    debug_assert_eq!(terminator, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        nodes: Vec<(u64, Coordinate, Vec<u8>)>,
        ways: Vec<(u64, Locator, Vec<u8>)>,
        relations: Vec<(u64, Locator, Vec<u8>)>,
        memberships: Vec<(u64, Locator, TypedFeatureId)>,
        foreign_nodes: Vec<(u32, u64, Coordinate, Option<u32>)>,
        foreign_features: Vec<(u32, FeatureType, u64, Bbox, u32)>,
        special: Vec<(u64, u32)>,
        exports: Vec<TypedFeatureId>,
    }

    impl TileSink for Recorder {
        fn node(&mut self, id: u64, xy: Coordinate, tags: &[u8]) {
            self.nodes.push((id, xy, tags.to_vec()));
        }
        fn way(&mut self, id: u64, locator: Locator, body: &[u8]) {
            self.ways.push((id, locator, body.to_vec()));
        }
        fn relation(&mut self, id: u64, locator: Locator, body: &[u8]) {
            self.relations.push((id, locator, body.to_vec()));
        }
        fn membership(&mut self, rel_id: u64, locator: Locator, member: TypedFeatureId) {
            self.memberships.push((rel_id, locator, member));
        }
        fn foreign_node(&mut self, src: u32, id: u64, xy: Coordinate, tex: Option<u32>) {
            self.foreign_nodes.push((src, id, xy, tex));
        }
        fn foreign_feature(
            &mut self,
            src: u32,
            ftype: FeatureType,
            id: u64,
            bounds: Bbox,
            tex: u32,
        ) {
            self.foreign_features.push((src, ftype, id, bounds, tex));
        }
        fn special_node(&mut self, id: u64, flags: u32) {
            self.special.push((id, flags));
        }
        fn export_table(&mut self, entries: &[TypedFeatureId]) {
            self.exports.extend_from_slice(entries);
        }
    }

    fn pile_bytes(tray: &mut PileTray, pile: u32) -> Vec<u8> {
        tray.drain()
            .into_iter()
            .find(|(p, _)| *p == pile)
            .map(|(_, d)| d)
            .unwrap_or_default()
    }

    #[test]
    fn node_records_round_trip() {
        let mut tray = PileTray::default();
        tray.write_node(1, 10, Coordinate::new(100, -50), b"");
        tray.write_node(1, 12, Coordinate::new(90, -60), b"\x05\x07");
        tray.write_node(1, 100, Coordinate::new(0, 0), b"");
        let data = pile_bytes(&mut tray, 1);
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.nodes.len(), 3);
        assert_eq!(rec.nodes[0], (10, Coordinate::new(100, -50), vec![]));
        assert_eq!(rec.nodes[1], (12, Coordinate::new(90, -60), vec![5, 7]));
        assert_eq!(rec.nodes[2], (100, Coordinate::new(0, 0), vec![]));
    }

    #[test]
    fn way_and_relation_records_round_trip() {
        let mut tray = PileTray::default();
        let mut nodes = Vec::new();
        write_signed_varint(&mut nodes, 4);
        write_signed_varint(&mut nodes, 1);
        write_signed_varint(&mut nodes, 1);
        // 3 nodes, not a ring
        tray.write_way(2, 44, Locator::default(), 3 << 1, &nodes, b"");
        tray.write_way(2, 45, Locator::new(crate::geom::TWIN_EAST, 0), 3 << 1, &nodes, b"");
        let data = pile_bytes(&mut tray, 2);
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.ways.len(), 2);
        assert_eq!(rec.ways[0].0, 44);
        assert!(rec.ways[0].1.is_empty());
        assert_eq!(rec.ways[1].0, 45);
        assert_eq!(rec.ways[1].1.twin_code(), crate::geom::TWIN_EAST);
        let mut body = Cursor::new(&rec.ways[0].2);
        assert_eq!(body.read_varint(), 3 << 1);
        assert_eq!(body.read_signed_varint(), 4);

        let mut tray = PileTray::default();
        tray.write_relation(3, 7, Locator::default(), 2, b"xy", b"");
        tray.write_membership(3, 9, Locator::new(1, 2), TypedFeatureId::of_way(44));
        let data = pile_bytes(&mut tray, 3);
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.relations.len(), 1);
        assert_eq!(rec.relations[0].0, 7);
        let mut body = Cursor::new(&rec.relations[0].2);
        assert_eq!(body.read_varint(), 2); // member count
        assert_eq!(rec.memberships, vec![(9, Locator::new(1, 2), TypedFeatureId::of_way(44))]);
    }

    #[test]
    fn foreign_records_round_trip_with_backward_ids() {
        let mut tray = PileTray::default();
        tray.write_foreign_node(5, 9, 100, Coordinate::new(1, 2), Some(7));
        // ids from another source pile may step backwards
        tray.write_foreign_node(5, 9, 50, Coordinate::new(-10, -20), None);
        let b = Bbox::new(-100, -200, 300, 400);
        tray.write_foreign_feature(5, 9, FeatureType::Way, 33, &b, 2);
        tray.write_foreign_feature(5, 9, FeatureType::Way, 20, &Bbox::empty(), 3);
        let data = pile_bytes(&mut tray, 5);
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.foreign_nodes.len(), 2);
        assert_eq!(rec.foreign_nodes[0], (9, 100, Coordinate::new(1, 2), Some(7)));
        assert_eq!(rec.foreign_nodes[1], (9, 50, Coordinate::new(-10, -20), None));
        assert_eq!(rec.foreign_features.len(), 2);
        assert_eq!(rec.foreign_features[0], (9, FeatureType::Way, 33, b, 2));
        let (_, _, id, bounds, tex) = rec.foreign_features[1];
        assert_eq!((id, tex), (20, 3));
        assert!(bounds.is_empty());
    }

    #[test]
    fn special_nodes_and_export_table() {
        let mut tray = PileTray::default();
        tray.write_special_node(4, 10, SPECIAL_SHARED);
        tray.write_special_node(4, 22, SPECIAL_ORPHAN | SPECIAL_SHARED);
        let data = pile_bytes(&mut tray, 4);
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.special, vec![(10, SPECIAL_SHARED), (22, SPECIAL_ORPHAN | SPECIAL_SHARED)]);

        let mut tray = PileTray::default();
        let entries = vec![
            TypedFeatureId::of_node(900),
            TypedFeatureId::of_way(12),
            TypedFeatureId::of_relation(5),
        ];
        tray.write_export_table(6, &entries);
        let data = pile_bytes(&mut tray, 6);
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.exports, entries);
    }

    #[test]
    fn groups_reopen_after_close() {
        let mut tray = PileTray::default();
        tray.write_node(1, 10, Coordinate::new(5, 5), b"");
        tray.close_groups();
        // same pile, new group instance: deltas restart
        tray.write_special_node(1, 10, SPECIAL_ORPHAN);
        let data = pile_bytes(&mut tray, 1);
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.nodes.len(), 1);
        assert_eq!(rec.special, vec![(10, SPECIAL_ORPHAN)]);
    }

    #[test]
    fn batches_from_separate_trays_concatenate() {
        // what the pile file sees across two worker flushes
        let mut tray1 = PileTray::default();
        tray1.write_node(1, 10, Coordinate::new(5, 5), b"");
        let mut tray2 = PileTray::default();
        tray2.write_node(1, 11, Coordinate::new(6, 6), b"");
        let mut data = pile_bytes(&mut tray1, 1);
        data.extend(pile_bytes(&mut tray2, 1));
        let mut rec = Recorder::default();
        read_tile(&data, &mut rec);
        assert_eq!(rec.nodes.len(), 2);
        assert_eq!(rec.nodes[1].0, 11);
        assert_eq!(rec.nodes[1].1, Coordinate::new(6, 6));
    }
}
