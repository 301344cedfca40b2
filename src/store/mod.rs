//! The GOL output file: a page-aligned blob store with a fixed header,
//! the global string table, the indexed-keys table, and a tile index
//! mapping each pile to the page of its compressed tile blob.
//!
//! The builder only touches the narrow `add_tile`/`finish` surface; the
//! `info` and `check` commands read it back.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::build::settings::IndexedKey;
use crate::common::varint::{write_varint, Cursor};
use crate::geom::ZoomLevels;

const MAGIC: &[u8; 4] = b"GOL1";
const VERSION: u32 = 1;
pub const PAGE_SIZE: u64 = 4096;
const HEADER_LEN: usize = 100;
const FLAG_WAYNODE_IDS: u32 = 1;

/// Deflate a tile blob (always through the deflate finisher).
pub fn compress_blob(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("[store] compression failed")?;
    encoder.finish().context("[store] compression failed")
}

pub fn uncompress_blob(data: &[u8], raw_len: u32) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::with_capacity(raw_len as usize));
    decoder.write_all(data).context("[store] corrupt tile blob")?;
    let out = decoder.finish().context("[store] corrupt tile blob")?;
    ensure!(out.len() == raw_len as usize, "[store] tile blob length mismatch");
    Ok(out)
}

#[derive(Clone, Debug)]
pub struct GolMetadata {
    pub guid: [u8; 16],
    pub revision: u32,
    pub waynode_ids: bool,
    pub zoom_levels: ZoomLevels,
    pub rtree_branch_size: u32,
    pub max_key_indexes: u32,
    pub key_index_min_features: u32,
}

#[derive(Copy, Clone, Default)]
struct TileEntry {
    page: u64,
    compressed_len: u32,
    raw_len: u32,
}

pub struct GolWriter {
    file: File,
    next_page: u64,
    entries: Vec<TileEntry>,
}

impl GolWriter {
    pub fn create(path: &Path, tile_count: u32) -> Result<GolWriter> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(GolWriter {
            file,
            next_page: 1, // page 0 is the header
            entries: vec![TileEntry::default(); tile_count as usize + 1],
        })
    }

    fn add_blob(&mut self, data: &[u8]) -> Result<u64> {
        let page = self.next_page;
        self.file
            .write_all_at(data, page * PAGE_SIZE)
            .context("[store] blob write failed")?;
        self.next_page += (data.len() as u64).div_ceil(PAGE_SIZE);
        Ok(page)
    }

    /// Register a compiled tile. Called once per pile, any order.
    pub fn add_tile(&mut self, pile: u32, compressed: &[u8], raw_len: u32) -> Result<()> {
        debug_assert!(self.entries[pile as usize].page == 0, "tile added twice");
        let page = self.add_blob(compressed)?;
        self.entries[pile as usize] =
            TileEntry { page, compressed_len: compressed.len() as u32, raw_len };
        Ok(())
    }

    /// Write the string table, indexed keys, tile index and header.
    pub fn finish(
        mut self,
        meta: &GolMetadata,
        string_table: &[u8],
        indexed_keys: &[IndexedKey],
    ) -> Result<()> {
        let mut tile_index = Vec::with_capacity((self.entries.len() - 1) * 16);
        for e in &self.entries[1..] {
            tile_index.extend_from_slice(&e.page.to_le_bytes());
            tile_index.extend_from_slice(&e.compressed_len.to_le_bytes());
            tile_index.extend_from_slice(&e.raw_len.to_le_bytes());
        }
        let mut keys_blob = Vec::new();
        write_varint(&mut keys_blob, indexed_keys.len() as u64);
        for key in indexed_keys {
            write_varint(&mut keys_blob, key.category as u64);
            write_varint(&mut keys_blob, key.key.len() as u64);
            keys_blob.extend_from_slice(key.key.as_bytes());
        }

        let tile_count = (self.entries.len() - 1) as u32;
        let strings_page = self.add_blob(string_table)?;
        let keys_page = self.add_blob(&keys_blob)?;
        let index_page = self.add_blob(&tile_index)?;

        let mut header = vec![0u8; HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&VERSION.to_le_bytes());
        header[8..24].copy_from_slice(&meta.guid);
        header[24..28].copy_from_slice(&meta.revision.to_le_bytes());
        let flags = if meta.waynode_ids { FLAG_WAYNODE_IDS } else { 0 };
        header[28..32].copy_from_slice(&flags.to_le_bytes());
        header[32..36].copy_from_slice(&tile_count.to_le_bytes());
        header[36..40].copy_from_slice(&meta.rtree_branch_size.to_le_bytes());
        header[40..44].copy_from_slice(&meta.max_key_indexes.to_le_bytes());
        header[44..48].copy_from_slice(&meta.key_index_min_features.to_le_bytes());
        header[48..50].copy_from_slice(&zoom_bits(meta.zoom_levels).to_le_bytes());
        for (pos, page, len) in [
            (52, strings_page, string_table.len()),
            (68, keys_page, keys_blob.len()),
            (84, index_page, tile_index.len()),
        ] {
            header[pos..pos + 8].copy_from_slice(&page.to_le_bytes());
            header[pos + 8..pos + 16].copy_from_slice(&(len as u64).to_le_bytes());
        }
        self.file.write_all_at(&header, 0).context("[store] header write failed")?;
        self.file.sync_all().context("[store] sync failed")
    }
}

fn zoom_bits(levels: ZoomLevels) -> u16 {
    let mut bits = 0u16;
    for level in levels.iter() {
        bits |= 1 << level;
    }
    bits
}

pub struct GolReader {
    file: File,
    pub meta: GolMetadata,
    pub tile_count: u32,
    pub strings: Vec<String>,
    pub indexed_keys: Vec<IndexedKey>,
    entries: Vec<TileEntry>,
    pub file_len: u64,
}

impl GolReader {
    pub fn open(path: &Path) -> Result<GolReader> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let file_len = file.metadata()?.len();
        let mut header = [0u8; HEADER_LEN];
        file.read_exact_at(&mut header, 0)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        ensure!(&header[0..4] == MAGIC, "[store] {} is not a GOL", path.display());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        ensure!(version == VERSION, "[store] unsupported GOL version {version}");
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&header[8..24]);
        let revision = u32::from_le_bytes(header[24..28].try_into().unwrap());
        let flags = u32::from_le_bytes(header[28..32].try_into().unwrap());
        let tile_count = u32::from_le_bytes(header[32..36].try_into().unwrap());
        let rtree_branch_size = u32::from_le_bytes(header[36..40].try_into().unwrap());
        let max_key_indexes = u32::from_le_bytes(header[40..44].try_into().unwrap());
        let key_index_min_features = u32::from_le_bytes(header[44..48].try_into().unwrap());
        let zoom_bits = u16::from_le_bytes(header[48..50].try_into().unwrap());
        let mut zoom_levels = Vec::new();
        for level in 0..=12u32 {
            if zoom_bits & (1 << level) != 0 {
                zoom_levels.push(level);
            }
        }
        let meta = GolMetadata {
            guid,
            revision,
            waynode_ids: flags & FLAG_WAYNODE_IDS != 0,
            zoom_levels: ZoomLevels::from_levels(&zoom_levels)?,
            rtree_branch_size,
            max_key_indexes,
            key_index_min_features,
        };

        let read_section = |pos: usize| -> Result<Vec<u8>> {
            let page = u64::from_le_bytes(header[pos..pos + 8].try_into().unwrap());
            let len = u64::from_le_bytes(header[pos + 8..pos + 16].try_into().unwrap());
            ensure!(
                page * PAGE_SIZE + len <= file_len,
                "[store] section beyond end of file"
            );
            let mut buf = vec![0u8; len as usize];
            file.read_exact_at(&mut buf, page * PAGE_SIZE)
                .context("[store] section read failed")?;
            Ok(buf)
        };

        let strings_blob = read_section(52)?;
        ensure!(strings_blob.len() >= 2, "[store] truncated string table");
        let string_count = u16::from_le_bytes(strings_blob[0..2].try_into().unwrap());
        let mut strings = Vec::with_capacity(string_count as usize);
        let mut c = Cursor::new(&strings_blob[2..]);
        for _ in 0..string_count {
            let len = c.read_varint() as usize;
            strings.push(String::from_utf8_lossy(c.read_bytes(len)).into_owned());
        }

        let keys_blob = read_section(68)?;
        let mut c = Cursor::new(&keys_blob);
        let key_count = c.read_varint();
        let mut indexed_keys = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            let category = c.read_varint() as u32;
            let len = c.read_varint() as usize;
            let key = String::from_utf8_lossy(c.read_bytes(len)).into_owned();
            indexed_keys.push(IndexedKey { key, category });
        }

        let index_blob = read_section(84)?;
        ensure!(
            index_blob.len() == tile_count as usize * 16,
            "[store] tile index size mismatch"
        );
        let mut entries = vec![TileEntry::default(); tile_count as usize + 1];
        for (i, entry) in entries.iter_mut().enumerate().skip(1) {
            let rec = &index_blob[(i - 1) * 16..i * 16];
            entry.page = u64::from_le_bytes(rec[0..8].try_into().unwrap());
            entry.compressed_len = u32::from_le_bytes(rec[8..12].try_into().unwrap());
            entry.raw_len = u32::from_le_bytes(rec[12..16].try_into().unwrap());
        }

        Ok(GolReader { file, meta, tile_count, strings, indexed_keys, entries, file_len })
    }

    pub fn tile_blob_extent(&self, pile: u32) -> (u64, u32, u32) {
        let e = self.entries[pile as usize];
        (e.page, e.compressed_len, e.raw_len)
    }

    /// Load and decompress one tile.
    pub fn load_tile(&self, pile: u32) -> Result<Vec<u8>> {
        let e = self.entries[pile as usize];
        ensure!(e.page != 0, "[store] pile {pile} has no tile");
        let mut buf = vec![0u8; e.compressed_len as usize];
        self.file
            .read_exact_at(&mut buf, e.page * PAGE_SIZE)
            .context("[store] tile read failed")?;
        uncompress_blob(&buf, e.raw_len)
    }
}
