//! `exports.bin`: per-pile lookup tables from exported relation id to TEX,
//! written by the validator and consulted by the compiler to resolve
//! foreign relation references.
//!
//! Layout: magic, tile count, an offset per pile (0 = no section), then
//! the sections in completion order. A section is an entry count followed
//! by `(id: u64, tex: u32)` pairs sorted by id.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use memmap2::Mmap;

const MAGIC: &[u8; 4] = b"GOLX";
const ENTRY_SIZE: u64 = 12;

pub struct ExportFileWriter {
    file: File,
    offsets: Vec<u64>,
    size: u64,
}

impl ExportFileWriter {
    pub fn create(path: &Path, tile_count: u32) -> Result<ExportFileWriter> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&tile_count.to_le_bytes());
        file.write_all_at(&header, 0).context("[exports] header write failed")?;
        Ok(ExportFileWriter {
            file,
            offsets: vec![0; tile_count as usize],
            size: 8 + tile_count as u64 * 8,
        })
    }

    /// Record one pile's exported relations. `entries` must be sorted by id.
    pub fn write(&mut self, pile: u32, entries: &[(u64, u32)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        let mut buf = Vec::with_capacity(4 + entries.len() * ENTRY_SIZE as usize);
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for &(id, tex) in entries {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&tex.to_le_bytes());
        }
        self.file
            .write_all_at(&buf, self.size)
            .context("[exports] section write failed")?;
        self.offsets[pile as usize - 1] = self.size;
        self.size += buf.len() as u64;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        let mut buf = Vec::with_capacity(self.offsets.len() * 8);
        for ofs in &self.offsets {
            buf.extend_from_slice(&ofs.to_le_bytes());
        }
        self.file.write_all_at(&buf, 8).context("[exports] offset table write failed")
    }
}

/// Read-only view used by the compiler.
pub struct ExportFileReader {
    mmap: Mmap,
    tile_count: u32,
}

impl ExportFileReader {
    pub fn open(path: &Path) -> Result<ExportFileReader> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map {}", path.display()))?;
        ensure!(
            mmap.len() >= 8 && &mmap[0..4] == MAGIC,
            "[exports] {} is not an exports file",
            path.display()
        );
        let tile_count = u32::from_le_bytes(mmap[4..8].try_into().unwrap());
        ensure!(
            mmap.len() as u64 >= 8 + tile_count as u64 * 8,
            "[exports] truncated offset table"
        );
        Ok(ExportFileReader { mmap, tile_count })
    }

    /// TEX of an exported relation in the given pile, if any.
    pub fn tex_of_relation(&self, pile: u32, id: u64) -> Option<u32> {
        debug_assert!(pile >= 1 && pile <= self.tile_count);
        let ofs_pos = 8 + (pile as usize - 1) * 8;
        let ofs =
            u64::from_le_bytes(self.mmap[ofs_pos..ofs_pos + 8].try_into().unwrap()) as usize;
        if ofs == 0 {
            return None;
        }
        let count = u32::from_le_bytes(self.mmap[ofs..ofs + 4].try_into().unwrap()) as usize;
        let entries = &self.mmap[ofs + 4..ofs + 4 + count * ENTRY_SIZE as usize];
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let rec = &entries[mid * 12..mid * 12 + 12];
            let mid_id = u64::from_le_bytes(rec[0..8].try_into().unwrap());
            match mid_id.cmp(&id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    return Some(u32::from_le_bytes(rec[8..12].try_into().unwrap()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exports.bin");
        let mut writer = ExportFileWriter::create(&path, 3).unwrap();
        writer.write(2, &[(5, 0), (100, 1), (7_000_000_000, 2)]).unwrap();
        writer.write(1, &[(42, 9)]).unwrap();
        writer.close().unwrap();

        let reader = ExportFileReader::open(&path).unwrap();
        assert_eq!(reader.tex_of_relation(2, 5), Some(0));
        assert_eq!(reader.tex_of_relation(2, 100), Some(1));
        assert_eq!(reader.tex_of_relation(2, 7_000_000_000), Some(2));
        assert_eq!(reader.tex_of_relation(2, 6), None);
        assert_eq!(reader.tex_of_relation(1, 42), Some(9));
        // pile without exported relations
        assert_eq!(reader.tex_of_relation(3, 1), None);
    }
}
