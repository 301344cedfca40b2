//! End-to-end scenarios: tiny synthetic OSM sources run through the full
//! four-phase pipeline, asserted at the pile, index and store level.

use std::path::PathBuf;

use crate::build::compile::layout::check_tile_blob;
use crate::build::id_index::MappedIndex;
use crate::build::pile::PileFile;
use crate::build::proto::{read_tile, Locator, TileSink, SPECIAL_ORPHAN};
use crate::build::settings::BuildSettings;
use crate::build::strings::{StringCatalog, CORE_STRINGS};
use crate::build::GolBuilder;
use crate::common::varint::Cursor;
use crate::common::Verbosity;
use crate::feature::{FeatureType, TypedFeatureId};
use crate::geom::{Bbox, Coordinate, TWIN_EAST, TWIN_WEST};
use crate::osm::{Block, MemSource, RawMember, RawNode, RawRelation, RawWay};
use crate::store::GolReader;

// -------------------------------------------------------------------
// test source construction

#[derive(Default)]
struct BlockBuilder {
    block: Block,
}

impl BlockBuilder {
    fn new() -> BlockBuilder {
        let mut b = BlockBuilder::default();
        b.block.strings.push(String::new());
        b
    }

    fn code(&mut self, s: &str) -> u32 {
        match self.block.strings.iter().position(|x| x == s) {
            Some(i) => i as u32,
            None => {
                self.block.strings.push(s.to_string());
                self.block.strings.len() as u32 - 1
            }
        }
    }

    fn node(&mut self, id: i64, lon: f64, lat: f64, tags: &[(&str, &str)]) -> &mut Self {
        let mut encoded = Vec::new();
        for &(k, v) in tags {
            let k = self.code(k);
            let v = self.code(v);
            encoded.push(k);
            encoded.push(v);
        }
        self.block.nodes.push(RawNode {
            id,
            lon: (lon * 1e7).round() as i32,
            lat: (lat * 1e7).round() as i32,
            tags: encoded,
        });
        self
    }

    fn way(&mut self, id: i64, nodes: &[i64], tags: &[(&str, &str)]) -> &mut Self {
        let keys = tags.iter().map(|&(k, _)| self.code(k)).collect();
        let values = tags.iter().map(|&(_, v)| self.code(v)).collect();
        self.block.ways.push(RawWay { id, keys, values, nodes: nodes.to_vec() });
        self
    }

    fn relation(
        &mut self,
        id: i64,
        members: &[(FeatureType, i64, &str)],
        tags: &[(&str, &str)],
    ) -> &mut Self {
        let keys = tags.iter().map(|&(k, _)| self.code(k)).collect();
        let values = tags.iter().map(|&(_, v)| self.code(v)).collect();
        let members = members
            .iter()
            .map(|&(mtype, id, role)| RawMember { id, mtype, role: self.code(role) })
            .collect();
        self.block.relations.push(RawRelation { id, keys, values, members });
        self
    }

    fn build(self) -> Block {
        self.block
    }
}

// -------------------------------------------------------------------
// pile inspection

#[derive(Default)]
struct Recorder {
    nodes: Vec<(u64, Coordinate, Vec<u8>)>,
    ways: Vec<(u64, Locator, Vec<u8>)>,
    relations: Vec<(u64, Locator, Vec<u8>)>,
    foreign_nodes: Vec<u64>,
    specials: Vec<(u64, u32)>,
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
    fn foreign_node(&mut self, _src: u32, id: u64, _xy: Coordinate, _tex: Option<u32>) {
        self.foreign_nodes.push(id);
    }
    fn special_node(&mut self, id: u64, flags: u32) {
        self.specials.push((id, flags));
    }
    fn export_table(&mut self, entries: &[TypedFeatureId]) {
        self.exports.extend_from_slice(entries);
    }
}

fn read_pile(piles: &PileFile, pile: u32) -> Recorder {
    let mut rec = Recorder::default();
    read_tile(&piles.load(pile).unwrap(), &mut rec);
    rec
}

/// Decode a tag stream that uses only literal strings (rare tags never
/// earn proto codes in these tiny sources).
fn decode_literal_tags(bytes: &[u8]) -> Vec<(String, String)> {
    let mut c = Cursor::new(bytes);
    let mut out = Vec::new();
    while !c.is_empty() {
        out.push((read_literal(&mut c), read_literal(&mut c)));
    }
    out
}

fn read_literal(c: &mut Cursor) -> String {
    let word = c.read_varint();
    assert_eq!(word & 1, 0, "expected a literal string");
    String::from_utf8(c.read_bytes((word >> 1) as usize).to_vec()).unwrap()
}

// -------------------------------------------------------------------

struct TestBuild {
    _dir: tempfile::TempDir,
    gol: PathBuf,
    work: PathBuf,
    indexes: PathBuf,
    summary: crate::build::BuildSummary,
}

fn run_build(settings: BuildSettings, make_blocks: impl Fn() -> Vec<Block>) -> TestBuild {
    let dir = tempfile::tempdir().unwrap();
    let gol = dir.path().join("test.gol");
    let mut settings = settings;
    settings.verbosity = Verbosity::Quiet;
    settings.keep_work = true;
    settings.keep_indexes = true;
    settings.complete().unwrap();
    let builder = GolBuilder::new(settings);
    let summary = builder
        .build_with(|| Ok(MemSource::new(make_blocks())), &gol)
        .unwrap();
    TestBuild {
        gol,
        work: dir.path().join("test-work"),
        indexes: dir.path().join("test-indexes"),
        _dir: dir,
        summary,
    }
}

fn pile_bits(tile_count: u32) -> u32 {
    32 - (tile_count + 1).leading_zeros()
}

#[test]
fn single_untagged_node() {
    let mut settings = BuildSettings::default();
    settings.set_indexed_keys("highway").unwrap();
    settings.thread_count = 1;
    let b = run_build(settings, || {
        let mut bb = BlockBuilder::new();
        bb.node(1, 0.0, 0.0, &[]);
        vec![bb.build()]
    });

    assert_eq!(b.summary.tile_count, 1);
    assert_eq!(b.summary.osm_stats.node_count, 1);
    assert_eq!(b.summary.global_string_count, CORE_STRINGS.len() + 1);

    let reader = GolReader::open(&b.gol).unwrap();
    assert_eq!(&reader.strings[..5], CORE_STRINGS);
    assert_eq!(reader.strings[5], "highway");

    let piles = PileFile::open_existing(&b.work.join("features.bin")).unwrap();
    let rec = read_pile(&piles, 1);
    assert_eq!(rec.nodes, vec![(1, Coordinate::new(0, 0), vec![])]);
    // no tags, no references: the node is an orphan
    assert_eq!(rec.specials, vec![(1, SPECIAL_ORPHAN)]);

    let blob = reader.load_tile(1).unwrap();
    check_tile_blob(&blob, blob.len() as u32).unwrap();
    let feature_count = u32::from_le_bytes(blob[52..56].try_into().unwrap());
    assert_eq!(feature_count, 1); // the orphan is kept as a feature
}

#[test]
fn single_tile_way_with_rings_and_rejects() {
    let mut settings = BuildSettings::default();
    settings.thread_count = 1;
    let b = run_build(settings, || {
        let mut nodes = BlockBuilder::new();
        nodes
            .node(1, 0.0, 0.0, &[])
            .node(2, 0.001, 0.0, &[])
            .node(3, 0.002, 0.0, &[]);
        let mut ways = BlockBuilder::new();
        ways.way(10, &[1, 2, 3], &[("highway", "unclassified")]);
        ways.way(20, &[1, 2, 3, 1], &[]); // closed ring
        ways.way(21, &[1, 2, 1], &[]); // degenerate ring: rejected
        ways.way(22, &[99], &[]); // missing node: rejected
        vec![nodes.build(), ways.build()]
    });

    assert_eq!(b.summary.tile_count, 1);
    assert_eq!(b.summary.sort_stats.way_count, 2);
    assert_eq!(b.summary.sort_stats.rejected_way_count, 2);
    assert_eq!(b.summary.sort_stats.missing_node_count, 1);

    let bits = pile_bits(b.summary.tile_count);
    let node_index =
        MappedIndex::open_existing(&b.indexes.join("nodes.idx"), 3, bits).unwrap();
    for id in 1..=3u64 {
        assert_eq!(node_index.get(id), 1, "node {id}");
    }
    let way_index =
        MappedIndex::open_existing(&b.indexes.join("ways.idx"), 22, bits + 2).unwrap();
    assert_eq!(way_index.get(10), 1 << 2);
    assert_eq!(way_index.get(20), 1 << 2);
    assert_eq!(way_index.get(21), 0);
    assert_eq!(way_index.get(22), 0);

    let piles = PileFile::open_existing(&b.work.join("features.bin")).unwrap();
    let rec = read_pile(&piles, 1);
    assert_eq!(rec.ways.len(), 2);

    let (id, locator, body) = &rec.ways[0];
    assert_eq!(*id, 10);
    assert!(locator.is_empty());
    let mut c = Cursor::new(body);
    assert_eq!(c.read_varint(), 3 << 1); // 3 nodes, no ring
    assert_eq!(
        (c.read_signed_varint(), c.read_signed_varint(), c.read_signed_varint()),
        (1, 1, 1)
    );
    let tags = decode_literal_tags(&body[c.pos()..]);
    assert_eq!(tags, vec![("highway".to_string(), "unclassified".to_string())]);

    let (id, _, body) = &rec.ways[1];
    assert_eq!(*id, 20);
    let mut c = Cursor::new(body);
    // the duplicated last node is dropped and the ring bit set
    assert_eq!(c.read_varint(), (3 << 1) | 1);
    assert_eq!(
        (c.read_signed_varint(), c.read_signed_varint(), c.read_signed_varint()),
        (1, 1, 1)
    );
    assert_eq!(c.remaining(), 0);

    // projected coordinates grow east in id order
    assert!(rec.nodes.windows(2).all(|w| w[0].1.x < w[1].1.x));
}

#[test]
fn way_across_two_tiles() {
    let mut settings = BuildSettings::default();
    settings.set_min_tile_density(1).unwrap();
    settings.thread_count = 2;
    let b = run_build(settings, || {
        let mut nodes = BlockBuilder::new();
        nodes.node(1, -0.001, 0.0, &[]).node(2, 0.001, 0.0, &[]);
        let mut ways = BlockBuilder::new();
        ways.way(30, &[1, 2], &[("highway", "primary")]);
        vec![nodes.build(), ways.build()]
    });

    // both ancestor chains survive consolidation: root + 2 tiles on each
    // of the six deeper levels
    assert_eq!(b.summary.tile_count, 13);
    assert_eq!(b.summary.sort_stats.multitile_way_count, 1);

    let bits = pile_bits(b.summary.tile_count);
    let node_index =
        MappedIndex::open_existing(&b.indexes.join("nodes.idx"), 2, bits).unwrap();
    let west_pile = node_index.get(1) as u32;
    let east_pile = node_index.get(2) as u32;
    assert!(west_pile != 0 && east_pile != 0 && west_pile != east_pile);

    let way_index =
        MappedIndex::open_existing(&b.indexes.join("ways.idx"), 30, bits + 2).unwrap();
    // the pair's first tile is the western one; the twin extends east
    assert_eq!(way_index.get(30), ((west_pile as u64) << 2) | 1);

    let piles = PileFile::open_existing(&b.work.join("features.bin")).unwrap();
    let west = read_pile(&piles, west_pile);
    let east = read_pile(&piles, east_pile);
    assert_eq!(west.ways.len(), 1);
    assert_eq!(east.ways.len(), 1);
    assert_eq!(west.ways[0].0, 30);
    assert_eq!(east.ways[0].0, 30);
    assert_eq!(west.ways[0].1.twin_code(), TWIN_EAST);
    assert_eq!(east.ways[0].1.twin_code(), TWIN_WEST);
    // identical bodies in both piles
    assert_eq!(west.ways[0].2, east.ways[0].2);
    let mut c = Cursor::new(&west.ways[0].2);
    assert_eq!(c.read_varint(), 2 << 1);

    // each side exports its node to the twin for geometry completion
    assert!(west.foreign_nodes.contains(&2));
    assert!(east.foreign_nodes.contains(&1));

    // every compiled tile passes the structural check
    let reader = GolReader::open(&b.gol).unwrap();
    for pile in 1..=reader.tile_count {
        let blob = reader.load_tile(pile).unwrap();
        check_tile_blob(&blob, blob.len() as u32).unwrap();
    }
}

#[test]
fn super_relation_cycle_is_broken_deterministically() {
    let mut settings = BuildSettings::default();
    settings.thread_count = 1;
    let b = run_build(settings, || {
        let mut nodes = BlockBuilder::new();
        nodes
            .node(1, 0.0, 0.0, &[])
            .node(2, 0.001, 0.0, &[])
            .node(3, 0.002, 0.0, &[]);
        let mut rels = BlockBuilder::new();
        rels.relation(
            1,
            &[(FeatureType::Node, 1, ""), (FeatureType::Relation, 2, "")],
            &[("type", "route_master")],
        );
        rels.relation(2, &[(FeatureType::Node, 2, ""), (FeatureType::Relation, 3, "")], &[]);
        rels.relation(3, &[(FeatureType::Node, 3, ""), (FeatureType::Relation, 1, "")], &[]);
        vec![nodes.build(), rels.build()]
    });

    assert_eq!(b.summary.sort_stats.super_relation_count, 3);
    assert_eq!(b.summary.sort_stats.ref_cycle_count, 1);

    let bits = pile_bits(b.summary.tile_count);
    let rel_index =
        MappedIndex::open_existing(&b.indexes.join("relations.idx"), 3, bits + 2).unwrap();
    for id in 1..=3u64 {
        assert_eq!(rel_index.get(id), 1 << 2, "relation {id}");
    }

    let piles = PileFile::open_existing(&b.work.join("features.bin")).unwrap();
    let rec = read_pile(&piles, 1);
    // written level by level: the loser (2, level 0), then 1, then 3
    let order: Vec<u64> = rec.relations.iter().map(|r| r.0).collect();
    assert_eq!(order, vec![2, 1, 3]);

    // relation 2 lost its member link to relation 3 and says so
    let (_, _, body) = &rec.relations[0];
    let mut c = Cursor::new(body);
    assert_eq!(c.read_varint(), 1); // only the node member remains
    assert_eq!(c.read_varint(), TypedFeatureId::of_node(2).raw());
    read_literal(&mut c); // its role
    let tags = decode_literal_tags(&body[c.pos()..]);
    assert_eq!(
        tags,
        vec![("geodesk:removed_refcycles".to_string(), "1".to_string())]
    );

    // the winners keep both members
    let mut c = Cursor::new(&rec.relations[1].2);
    assert_eq!(c.read_varint(), 2);
    let mut c = Cursor::new(&rec.relations[2].2);
    assert_eq!(c.read_varint(), 2);
}

#[test]
fn string_table_culling_against_a_synthetic_source() {
    // 400 frequent keys and 2000 one-off keys; the table budget holds 300
    let mut blocks = Vec::new();
    let mut bb = BlockBuilder::new();
    for id in 1..=150i64 {
        let tags: Vec<(String, String)> =
            (0..400).map(|k| (format!("k{k:03}"), "x".to_string())).collect();
        let borrowed: Vec<(&str, &str)> =
            tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        bb.node(id, id as f64 * 0.0001, 0.0, &borrowed);
    }
    let rare: Vec<(String, String)> =
        (0..2000).map(|k| (format!("r{k:04}"), "x".to_string())).collect();
    let borrowed: Vec<(&str, &str)> = rare.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    bb.node(151, 0.05, 0.0, &borrowed);
    blocks.push(bb.build());

    let settings = BuildSettings::default();
    let analysis =
        crate::build::analyze::analyze(MemSource::new(blocks), 1, &settings, &Default::default())
            .unwrap();
    assert_eq!(analysis.node_counts.sum(), 151);

    let mut catalog = StringCatalog::default();
    catalog.build(&analysis.strings, &[], 300, 2);
    assert_eq!(catalog.global_count(), CORE_STRINGS.len() + 300);
    // the most frequent strings are all catalogued: the shared value and
    // the leading frequent keys
    assert!(catalog.global_code_of("x").is_some());
    assert!(catalog.global_code_of("k000").is_some());
    // every frequent key still has a proto code, even past the GST budget
    for k in 0..400 {
        assert!(catalog.proto_pair(&format!("k{k:03}")).key.is_some(), "k{k:03}");
    }
    // one-off strings fall below the aggregation cutoff entirely
    assert!(catalog.proto_pair("r0000").key.is_none());
    assert_eq!(catalog.global_code_of("r0000"), None);
}

#[test]
fn compiled_tile_bbox_covers_features() {
    let mut settings = BuildSettings::default();
    settings.thread_count = 1;
    let b = run_build(settings, || {
        let mut nodes = BlockBuilder::new();
        nodes
            .node(1, 0.0, 0.0, &[("amenity", "cafe")])
            .node(2, 0.01, 0.01, &[("amenity", "bench")])
            .node(3, -0.01, -0.01, &[]);
        let mut ways = BlockBuilder::new();
        ways.way(10, &[1, 2, 3], &[("highway", "service")]);
        vec![nodes.build(), ways.build()]
    });

    // tags survive the sort pass byte-for-byte recoverable
    let piles = PileFile::open_existing(&b.work.join("features.bin")).unwrap();
    let rec = read_pile(&piles, 1);
    assert_eq!(
        decode_literal_tags(&rec.nodes[0].2),
        vec![("amenity".to_string(), "cafe".to_string())]
    );

    let reader = GolReader::open(&b.gol).unwrap();
    let blob = reader.load_tile(1).unwrap();
    check_tile_blob(&blob, blob.len() as u32).unwrap();
    let bbox = Bbox::new(
        i32::from_le_bytes(blob[4..8].try_into().unwrap()),
        i32::from_le_bytes(blob[8..12].try_into().unwrap()),
        i32::from_le_bytes(blob[12..16].try_into().unwrap()),
        i32::from_le_bytes(blob[16..20].try_into().unwrap()),
    );
    // the reported bbox must contain every feature's geometry
    for lon in [-0.01, 0.0, 0.01] {
        let c = Coordinate::from_lon_lat_100nd((lon * 1e7) as i32, (lon * 1e7) as i32);
        assert!(bbox.contains(c), "{c:?} outside {bbox:?}");
    }
}
