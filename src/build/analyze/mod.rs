//! Phase 1: one pass over the source that gathers everything the later
//! phases need up front — per-cell node counts for the tile layout and
//! string frequencies for the catalog.

use anyhow::Result;

use crate::build::settings::BuildSettings;
use crate::build::stats::OsmStats;
use crate::build::strings::{StringStats, CORE_STRINGS};
use crate::build::tiles::NodeCountGrid;
use crate::common::{CancelFlag, Verbosity};
use crate::geom::Coordinate;
use crate::osm::reader::{scan, OsmWorker, OutputQueue};
use crate::osm::{BlockSource, RawNode, RawRelation, RawWay};

const WORKER_TABLE_SLOTS: usize = 1 << 18;
const WORKER_ARENA_BYTES: usize = 2 << 20;
const GLOBAL_TABLE_SLOTS: usize = 1 << 21;
const GLOBAL_ARENA_BYTES: usize = 64 << 20;

pub struct AnalyzeResult {
    pub stats: OsmStats,
    pub node_counts: NodeCountGrid,
    pub strings: StringStats,
}

/// Run the analyze pass with `thread_count` workers.
pub fn analyze<S: BlockSource>(
    source: S,
    thread_count: usize,
    settings: &BuildSettings,
    cancel: &CancelFlag,
) -> Result<AnalyzeResult> {
    let mut global = StringStats::new(GLOBAL_TABLE_SLOTS, GLOBAL_ARENA_BYTES);
    for s in CORE_STRINGS {
        global.add_required(s);
    }
    for key in &settings.indexed_keys {
        global.add_required(&key.key);
    }

    let workers: Vec<AnalyzerWorker> = (0..thread_count).map(|_| AnalyzerWorker::new()).collect();

    // The aggregator merges worker batches on the output thread; when its
    // arena fills it culls rare strings and doubles the cutoff.
    let mut min_string_count: u64 = 2;
    let (workers, _) = scan(
        source,
        workers,
        |batch: Vec<u8>| {
            global.merge_batch(&batch, &mut min_string_count);
        },
        cancel,
    )?;

    let mut result = AnalyzeResult {
        stats: OsmStats::default(),
        node_counts: NodeCountGrid::new(),
        strings: global,
    };
    for worker in &workers {
        result.stats += worker.stats;
        result.node_counts.merge(&worker.node_counts);
    }

    if settings.verbosity >= Verbosity::Verbose {
        let s = &result.stats;
        eprintln!("[analyze] {:>14} nodes", s.node_count);
        eprintln!("[analyze] {:>14} ways", s.way_count);
        eprintln!("[analyze] {:>14} relations", s.relation_count);
        eprintln!("[analyze] {:>14} tags", s.tag_count);
        eprintln!("[analyze] {:>14} members", s.member_count);
        eprintln!("[analyze] {:>14} counted strings", result.strings.counter_count());
    }
    Ok(result)
}

struct AnalyzerWorker {
    node_counts: NodeCountGrid,
    strings: StringStats,
    /// per-block memo: block string index -> counter offset (0 = none yet)
    lookup: Vec<u32>,
    stats: OsmStats,
}

impl AnalyzerWorker {
    fn new() -> AnalyzerWorker {
        AnalyzerWorker {
            node_counts: NodeCountGrid::new(),
            strings: StringStats::new(WORKER_TABLE_SLOTS, WORKER_ARENA_BYTES),
            lookup: Vec::new(),
            stats: OsmStats::default(),
        }
    }

    fn flush(&mut self, out: &OutputQueue<Vec<u8>>) {
        out.post(self.strings.take_batch());
        // counter offsets refer to the old arena
        self.lookup.fill(0);
    }

    fn count_string(
        &mut self,
        index: u32,
        keys: u64,
        values: u64,
        strings: &[String],
        out: &OutputQueue<Vec<u8>>,
    ) {
        let s = &strings[index as usize];
        let mut ofs = self.lookup[index as usize];
        if ofs == 0 {
            ofs = match self.strings.counter(s) {
                Some(ofs) => ofs,
                None => {
                    self.flush(out);
                    self.strings.counter(s).expect("empty arena must fit one counter")
                }
            };
            self.lookup[index as usize] = ofs;
        }
        self.strings.add(ofs, keys, values);
    }
}

impl OsmWorker for AnalyzerWorker {
    type Output = Vec<u8>;

    fn string_table(&mut self, strings: &[String]) {
        self.lookup.clear();
        self.lookup.resize(strings.len(), 0);
    }

    fn node(&mut self, node: &RawNode, strings: &[String], out: &OutputQueue<Vec<u8>>) {
        self.node_counts.count(Coordinate::from_lon_lat_100nd(node.lon, node.lat));
        for pair in node.tags.chunks_exact(2) {
            self.count_string(pair[0], 1, 0, strings, out);
            self.count_string(pair[1], 0, 1, strings, out);
            self.stats.tag_count += 1;
        }
        self.stats.node_count += 1;
        self.stats.max_node_id = node.id; // ids are ordered within the source
    }

    fn begin_way_group(&mut self, _out: &OutputQueue<Vec<u8>>) {}

    fn way(&mut self, way: &RawWay, strings: &[String], out: &OutputQueue<Vec<u8>>) {
        for &k in &way.keys {
            self.count_string(k, 1, 0, strings, out);
        }
        for &v in &way.values {
            self.count_string(v, 0, 1, strings, out);
            self.stats.tag_count += 1;
        }
        self.stats.way_count += 1;
        self.stats.max_way_id = way.id;
    }

    fn begin_relation_group(&mut self, _out: &OutputQueue<Vec<u8>>) {}

    fn relation(&mut self, rel: &RawRelation, strings: &[String], out: &OutputQueue<Vec<u8>>) {
        for &k in &rel.keys {
            self.count_string(k, 1, 0, strings, out);
        }
        for &v in &rel.values {
            self.count_string(v, 0, 1, strings, out);
            self.stats.tag_count += 1;
        }
        for m in &rel.members {
            // roles share the value statistics
            self.count_string(m.role, 0, 1, strings, out);
            self.stats.member_count += 1;
        }
        self.stats.relation_count += 1;
        self.stats.max_relation_id = rel.id;
    }

    fn end_block(&mut self, _out: &OutputQueue<Vec<u8>>) {
        self.lookup.clear();
    }

    fn after_tasks(&mut self, out: &OutputQueue<Vec<u8>>) {
        self.flush(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::{Block, MemSource, RawMember};
    use crate::feature::FeatureType;

    fn block() -> Block {
        let mut b = Block::default();
        b.strings =
            vec!["".into(), "highway".into(), "residential".into(), "name".into(), "outer".into()];
        for id in 1..=10 {
            b.nodes.push(RawNode { id, lon: id as i32 * 1000, lat: 0, tags: vec![1, 2] });
        }
        b.ways.push(RawWay { id: 100, keys: vec![1], values: vec![2], nodes: vec![1, 2, 3] });
        b.relations.push(RawRelation {
            id: 200,
            keys: vec![3],
            values: vec![2],
            members: vec![RawMember { id: 100, mtype: FeatureType::Way, role: 4 }],
        });
        b
    }

    #[test]
    fn analyze_counts_everything_once() {
        let settings = BuildSettings::default();
        let source = MemSource::new(vec![block(), block()]);
        // one worker so rare strings aren't split below the merge cutoff
        let result = analyze(source, 1, &settings, &Default::default()).unwrap();

        assert_eq!(result.stats.node_count, 20);
        assert_eq!(result.stats.way_count, 2);
        assert_eq!(result.stats.relation_count, 2);
        assert_eq!(result.stats.max_node_id, 10);
        assert_eq!(result.stats.max_way_id, 100);
        assert_eq!(result.stats.max_relation_id, 200);
        // grid total equals accepted nodes
        assert_eq!(result.node_counts.sum(), 20);

        // "highway" was used 11x as key per block; "residential" 11x as value
        let mut found = std::collections::HashMap::new();
        for c in result.strings.iter() {
            found.insert(c.string.to_string(), (c.keys, c.values(), c.required));
        }
        assert_eq!(found["highway"], (22, 0, false));
        assert_eq!(found["residential"], (0, 22, false));
        assert_eq!(found["name"], (2, 0, false));
        // the role string counts as a value; "outer" is also required
        let outer = found["outer"];
        assert_eq!((outer.0, outer.1), (0, 2));
        assert!(outer.2);
        // required strings exist even when never used
        assert!(found[""].2);
    }
}
