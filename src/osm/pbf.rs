use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ahash::AHashMap;
use anyhow::{Context, Result};
use osmpbf::{Blob, BlobDecode, BlobReader, PrimitiveBlock, RelMemberType};

use super::{Block, BlockSource, RawMember, RawNode, RawRelation, RawWay};
use crate::feature::FeatureType;

/// Reads an `.osm.pbf` file blob by blob. Decompression and protobuf
/// decoding run on the worker that receives the blob, so the reader thread
/// only does framing.
pub struct PbfSource {
    reader: BlobReader<BufReader<File>>,
}

impl PbfSource {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = BlobReader::from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(PbfSource { reader })
    }
}

impl BlockSource for PbfSource {
    type Blob = Blob;

    fn next_blob(&mut self) -> Result<Option<Blob>> {
        match self.reader.next() {
            None => Ok(None),
            Some(blob) => Ok(Some(blob.context("Bad OSM PBF framing")?)),
        }
    }

    fn decode(blob: Blob) -> Result<Option<Block>> {
        match blob.decode().context("Bad OSM PBF block")? {
            BlobDecode::OsmData(block) => Ok(Some(convert(&block))),
            BlobDecode::OsmHeader(_) | BlobDecode::Unknown(_) => Ok(None),
        }
    }
}

/// Re-key the block onto its own string table. `osmpbf` resolves tag and
/// role strings for us; we intern them per block so downstream stages can
/// keep per-block translation tables keyed by small indices.
fn convert(block: &PrimitiveBlock) -> Block {
    let mut out = Block::default();
    let mut intern = Interner::default();
    // index 0 is reserved for the empty string, as in the PBF format itself
    intern.code("", &mut out.strings);

    for group in block.groups() {
        for node in group.nodes() {
            let mut tags = Vec::new();
            for (k, v) in node.tags() {
                tags.push(intern.code(k, &mut out.strings));
                tags.push(intern.code(v, &mut out.strings));
            }
            out.nodes.push(RawNode {
                id: node.id(),
                lon: node.decimicro_lon(),
                lat: node.decimicro_lat(),
                tags,
            });
        }
        for node in group.dense_nodes() {
            let mut tags = Vec::new();
            for (k, v) in node.tags() {
                tags.push(intern.code(k, &mut out.strings));
                tags.push(intern.code(v, &mut out.strings));
            }
            out.nodes.push(RawNode {
                id: node.id(),
                lon: node.decimicro_lon(),
                lat: node.decimicro_lat(),
                tags,
            });
        }
        for way in group.ways() {
            let mut keys = Vec::new();
            let mut values = Vec::new();
            for (k, v) in way.tags() {
                keys.push(intern.code(k, &mut out.strings));
                values.push(intern.code(v, &mut out.strings));
            }
            out.ways.push(RawWay {
                id: way.id(),
                keys,
                values,
                nodes: way.refs().collect(),
            });
        }
        for rel in group.relations() {
            let mut keys = Vec::new();
            let mut values = Vec::new();
            for (k, v) in rel.tags() {
                keys.push(intern.code(k, &mut out.strings));
                values.push(intern.code(v, &mut out.strings));
            }
            let members = rel
                .members()
                .map(|m| RawMember {
                    id: m.member_id,
                    mtype: match m.member_type {
                        RelMemberType::Node => FeatureType::Node,
                        RelMemberType::Way => FeatureType::Way,
                        RelMemberType::Relation => FeatureType::Relation,
                    },
                    role: intern.code(m.role().unwrap_or(""), &mut out.strings),
                })
                .collect();
            out.relations.push(RawRelation { id: rel.id(), keys, values, members });
        }
    }
    out
}

#[derive(Default)]
struct Interner {
    map: AHashMap<String, u32>,
}

impl Interner {
    fn code(&mut self, s: &str, strings: &mut Vec<String>) -> u32 {
        if let Some(&c) = self.map.get(s) {
            return c;
        }
        let c = strings.len() as u32;
        strings.push(s.to_string());
        self.map.insert(s.to_string(), c);
        c
    }
}
