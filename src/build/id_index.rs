//! Memory-mapped feature-id → pile indexes.
//!
//! Values are packed edge-to-edge at a fixed bit width, so a planet-scale
//! node index stays proportional to `max_id * ⌈log2(tiles+1)⌉` bits. The
//! backing file is sparse; untouched regions never materialize.
//!
//! Writes go through worker-local `FastIndex` batches and each id is
//! written at most once per phase, so the underlying stores are plain
//! atomic ORs: concurrent flushes from different workers cannot tear a
//! value even when it straddles a word boundary.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use memmap2::MmapMut;

pub struct MappedIndex {
    // field order matters: the map must drop before the file
    mmap: MmapMut,
    file: File,
    path: PathBuf,
    value_width: u32,
    max_id: i64,
}

impl MappedIndex {
    /// Create (truncating) an index for ids `0..=max_id` storing values of
    /// `value_width` bits.
    pub fn create(path: &Path, max_id: i64, value_width: u32) -> Result<MappedIndex> {
        debug_assert!(value_width >= 1 && value_width < 64);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let bits = (max_id as u64 + 1) * value_width as u64;
        let bytes = (bits.div_ceil(8) + 8).next_multiple_of(4096);
        file.set_len(bytes)
            .with_context(|| format!("Failed to size {}", path.display()))?;
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("Failed to map {}", path.display()))?;
        Ok(MappedIndex {
            mmap,
            file,
            path: path.to_path_buf(),
            value_width,
            max_id,
        })
    }

    /// Map an index kept from an earlier build (`--updatable`).
    pub fn open_existing(path: &Path, max_id: i64, value_width: u32) -> Result<MappedIndex> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("Failed to map {}", path.display()))?;
        Ok(MappedIndex {
            mmap,
            file,
            path: path.to_path_buf(),
            value_width,
            max_id,
        })
    }

    #[inline]
    fn words(&self) -> &[AtomicU64] {
        // the mapping is page-aligned and sized in whole words
        unsafe {
            std::slice::from_raw_parts(
                self.mmap.as_ptr() as *const AtomicU64,
                self.mmap.len() / 8,
            )
        }
    }

    /// Store `value` for `id`. Write-once per id per phase; value overflow
    /// is a programming error (debug assert, clamped in release).
    pub fn put(&self, id: u64, value: u64) {
        debug_assert!(id as i64 <= self.max_id);
        debug_assert!(value < (1u64 << self.value_width), "value overflow");
        let value = value & ((1u64 << self.value_width) - 1);
        let bit = id * self.value_width as u64;
        let word = (bit / 64) as usize;
        let shift = (bit % 64) as u32;
        let words = self.words();
        words[word].fetch_or(value << shift, Ordering::Relaxed);
        if shift + self.value_width > 64 {
            words[word + 1].fetch_or(value >> (64 - shift), Ordering::Relaxed);
        }
    }

    pub fn get(&self, id: u64) -> u64 {
        if id as i64 > self.max_id {
            return 0;
        }
        let bit = id * self.value_width as u64;
        let word = (bit / 64) as usize;
        let shift = (bit % 64) as u32;
        let words = self.words();
        let mut v = words[word].load(Ordering::Relaxed) >> shift;
        if shift + self.value_width > 64 {
            v |= words[word + 1].load(Ordering::Relaxed) << (64 - shift);
        }
        v & ((1u64 << self.value_width) - 1)
    }

    /// Flush to disk (kept indexes in `--updatable` builds).
    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush()
            .with_context(|| format!("Failed to sync {}", self.path.display()))
    }

    /// Dematerialize: unmap and truncate the backing file.
    pub fn clear(self) -> Result<()> {
        let MappedIndex { mmap, file, path, .. } = self;
        drop(mmap);
        file.set_len(0)
            .with_context(|| format!("Failed to truncate {}", path.display()))
    }
}

/// Worker-local write buffer over a shared `MappedIndex`. Batches are
/// flushed at block and phase boundaries; `get` reads only flushed state,
/// which the phase barriers make complete by the time anyone reads.
pub struct FastIndex {
    index: Arc<MappedIndex>,
    batch: Vec<(u64, u64)>,
}

impl FastIndex {
    pub fn new(index: Arc<MappedIndex>) -> FastIndex {
        FastIndex { index, batch: Vec::with_capacity(1024) }
    }

    pub fn put(&mut self, id: u64, value: u64) {
        self.batch.push((id, value));
    }

    pub fn get(&self, id: u64) -> u64 {
        self.index.get(id)
    }

    pub fn end_batch(&mut self) {
        for &(id, value) in &self.batch {
            self.index.put(id, value);
        }
        self.batch.clear();
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.batch.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(width: u32, max_id: i64) -> (tempfile::TempDir, MappedIndex) {
        let dir = tempfile::tempdir().unwrap();
        let idx = MappedIndex::create(&dir.path().join("test.idx"), max_id, width).unwrap();
        (dir, idx)
    }

    #[test]
    fn put_get_round_trip_across_word_boundaries() {
        // width 13 guarantees many values straddle 64-bit words
        let (_dir, idx) = index_with(13, 1000);
        for id in 0..=1000u64 {
            idx.put(id, (id * 7) % (1 << 13));
        }
        for id in 0..=1000u64 {
            assert_eq!(idx.get(id), (id * 7) % (1 << 13), "id {id}");
        }
    }

    #[test]
    fn unwritten_ids_read_zero() {
        let (_dir, idx) = index_with(10, 1 << 20);
        idx.put(500_000, 123);
        assert_eq!(idx.get(499_999), 0);
        assert_eq!(idx.get(500_000), 123);
        assert_eq!(idx.get(500_001), 0);
        // out-of-range ids read as absent rather than faulting
        assert_eq!(idx.get(u32::MAX as u64), 0);
    }

    #[test]
    fn concurrent_writers_do_not_tear_values() {
        let (_dir, idx) = index_with(34, 40_000);
        let idx = Arc::new(idx);
        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let idx = Arc::clone(&idx);
                scope.spawn(move || {
                    let mut fast = FastIndex::new(idx);
                    for id in (worker * 10_000)..(worker * 10_000 + 10_000) {
                        fast.put(id, id | 1 << 33);
                        if id % 997 == 0 {
                            fast.end_batch();
                        }
                    }
                    fast.end_batch();
                });
            }
        });
        for id in 0..40_000u64 {
            assert_eq!(idx.get(id), id | 1 << 33, "id {id}");
        }
    }

    #[test]
    fn clear_truncates_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.idx");
        let idx = MappedIndex::create(&path, 1 << 30, 12).unwrap();
        idx.put(1 << 29, 42);
        idx.sync().unwrap();
        idx.clear().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
