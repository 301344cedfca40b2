//! The boundary to the OSM source: a decoded block model, sources that
//! produce blocks, and the parallel pump that feeds them to workers.
//!
//! PBF framing, decompression and delta decoding happen in the `osmpbf`
//! crate; everything downstream sees blocks whose tag and role fields are
//! indices into the block's own string table. A block is always processed
//! start-to-finish by a single worker, and `string_table` is delivered
//! before any primitive of the block.

mod pbf;
pub mod reader;

pub use pbf::PbfSource;

use crate::feature::FeatureType;
use anyhow::Result;

/// One decoded OSM block: the block-local string table plus primitives in
/// source order (nodes, then ways, then relations).
#[derive(Default, Debug)]
pub struct Block {
    pub strings: Vec<String>,
    pub nodes: Vec<RawNode>,
    pub ways: Vec<RawWay>,
    pub relations: Vec<RawRelation>,
}

#[derive(Debug)]
pub struct RawNode {
    pub id: i64,
    /// 100-nanodegree units
    pub lon: i32,
    pub lat: i32,
    /// alternating key/value indices into the block string table
    pub tags: Vec<u32>,
}

#[derive(Debug)]
pub struct RawWay {
    pub id: i64,
    pub keys: Vec<u32>,
    pub values: Vec<u32>,
    pub nodes: Vec<i64>,
}

#[derive(Debug)]
pub struct RawRelation {
    pub id: i64,
    pub keys: Vec<u32>,
    pub values: Vec<u32>,
    pub members: Vec<RawMember>,
}

#[derive(Copy, Clone, Debug)]
pub struct RawMember {
    pub id: i64,
    pub mtype: FeatureType,
    /// role string index into the block string table
    pub role: u32,
}

/// Produces encoded blobs on the reader thread; workers decode them in
/// parallel. `decode` is an associated function so workers need no access
/// to the source itself.
pub trait BlockSource {
    type Blob: Send + 'static;

    fn next_blob(&mut self) -> Result<Option<Self::Blob>>;

    /// Decode a blob into a block; `None` for non-data blobs (headers).
    fn decode(blob: Self::Blob) -> Result<Option<Block>>;
}

/// An in-memory source of pre-built blocks, used by tests.
pub struct MemSource {
    blocks: std::vec::IntoIter<Block>,
}

impl MemSource {
    pub fn new(blocks: Vec<Block>) -> Self {
        MemSource { blocks: blocks.into_iter() }
    }
}

impl BlockSource for MemSource {
    type Blob = Block;

    fn next_blob(&mut self) -> Result<Option<Block>> {
        Ok(self.blocks.next())
    }

    fn decode(blob: Block) -> Result<Option<Block>> {
        Ok(Some(blob))
    }
}
