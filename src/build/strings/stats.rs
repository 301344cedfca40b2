//! String occurrence counters, arena-packed so a worker can hand its whole
//! batch to the aggregator as one allocation.
//!
//! A counter record lives at a fixed arena offset and is chained into a
//! hash table of offsets. Record layout (little-endian):
//!
//! ```text
//! 0   next      u32   offset of next counter in the chain (0 = none)
//! 4   hash      u32   content hash (stable, see string_hash)
//! 8   total     u64   key uses + value uses
//! 16  keys      u64   key uses
//! 24  len       u16   string byte length
//! 26  flags     u8    bit 0 = required
//! 27  bytes     [u8]  the string, padded to a 4-byte boundary
//! ```

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};

use super::string_hash;

/// Minimum total occurrences for a string to enter the proto-string table.
pub const MIN_PROTO_STRING_USAGE: u64 = 100;

const ARENA_BASE: usize = 8; // offset 0 doubles as "null"
const OFS_NEXT: usize = 0;
const OFS_HASH: usize = 4;
const OFS_TOTAL: usize = 8;
const OFS_KEYS: usize = 16;
const OFS_LEN: usize = 24;
const OFS_FLAGS: usize = 26;
const HEADER_LEN: usize = 27;
const FLAG_REQUIRED: u8 = 1;

pub struct StringStats {
    table: Vec<u32>,
    arena: Vec<u8>,
    arena_limit: usize,
    counter_count: usize,
}

impl StringStats {
    /// `table_slots` must be a power of two.
    pub fn new(table_slots: usize, arena_limit: usize) -> Self {
        debug_assert!(table_slots.is_power_of_two());
        StringStats {
            table: vec![0; table_slots],
            arena: empty_arena(arena_limit),
            arena_limit,
            counter_count: 0,
        }
    }

    pub fn counter_count(&self) -> usize {
        self.counter_count
    }

    /// Find or create the counter for `s`. `None` means the arena is full
    /// and the caller must flush (workers) or cull (the aggregator) first.
    pub fn counter(&mut self, s: &str) -> Option<u32> {
        self.counter_hashed(s, string_hash(s))
    }

    pub fn counter_hashed(&mut self, s: &str, hash: u32) -> Option<u32> {
        let slot = (hash as usize) & (self.table.len() - 1);
        let mut ofs = self.table[slot];
        while ofs != 0 {
            if self.hash(ofs) == hash && self.string(ofs) == s {
                return Some(ofs);
            }
            ofs = self.next(ofs);
        }
        let gross = gross_size(s.len());
        if self.arena.len() + gross > self.arena_limit {
            return None;
        }
        let ofs = self.arena.len() as u32;
        self.arena.resize(self.arena.len() + gross, 0);
        self.put_u32(ofs as usize + OFS_NEXT, self.table[slot]);
        self.put_u32(ofs as usize + OFS_HASH, hash);
        self.put_u16(ofs as usize + OFS_LEN, s.len() as u16);
        let start = ofs as usize + HEADER_LEN;
        self.arena[start..start + s.len()].copy_from_slice(s.as_bytes());
        self.table[slot] = ofs;
        self.counter_count += 1;
        Some(ofs)
    }

    /// Pre-seed a counter that must survive every cull and usage gate.
    pub fn add_required(&mut self, s: &str) {
        let ofs = self
            .counter(s)
            .expect("arena must have room for required strings");
        let flags_ofs = ofs as usize + OFS_FLAGS;
        self.arena[flags_ofs] |= FLAG_REQUIRED;
    }

    pub fn add(&mut self, ofs: u32, keys: u64, values: u64) {
        let base = ofs as usize;
        self.put_u64(base + OFS_TOTAL, self.total(ofs) + keys + values);
        self.put_u64(base + OFS_KEYS, self.keys(ofs) + keys);
    }

    /// Hand off the arena contents and reset to empty. The table is
    /// cleared, so previously returned counter offsets become invalid.
    pub fn take_batch(&mut self) -> Vec<u8> {
        let batch = std::mem::replace(&mut self.arena, empty_arena(self.arena_limit));
        self.table.fill(0);
        self.counter_count = 0;
        batch
    }

    /// Merge one worker batch. When the arena fills, counters below
    /// `min_count` are culled and `min_count` doubles; the loop always
    /// terminates because required counters alone must fit.
    pub fn merge_batch(&mut self, batch: &[u8], min_count: &mut u64) {
        for c in iter_batch(batch) {
            if c.total < *min_count && !c.required {
                continue;
            }
            loop {
                if let Some(ofs) = self.counter_hashed(c.string, c.hash) {
                    self.add(ofs, c.keys, c.total - c.keys);
                    if c.required {
                        self.arena[ofs as usize + OFS_FLAGS] |= FLAG_REQUIRED;
                    }
                    break;
                }
                self.cull(*min_count);
                *min_count <<= 1;
            }
        }
    }

    /// Drop all counters whose total count is below `min_count` (required
    /// counters always stay) and rebuild the arena compactly.
    pub fn cull(&mut self, min_count: u64) {
        let old = std::mem::replace(&mut self.arena, empty_arena(self.arena_limit));
        self.table.fill(0);
        self.counter_count = 0;
        for c in iter_batch(&old) {
            if c.total < min_count && !c.required {
                continue;
            }
            let ofs = self
                .counter_hashed(c.string, c.hash)
                .expect("culled arena cannot overflow");
            self.add(ofs, c.keys, c.total - c.keys);
            if c.required {
                self.arena[ofs as usize + OFS_FLAGS] |= FLAG_REQUIRED;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Counter<'_>> {
        iter_batch(&self.arena)
    }

    /// Raw arena dump, reloadable with `load` (debug artifact).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = Vec::with_capacity(self.arena.len() + 8);
        out.extend_from_slice(b"GOLS");
        out.extend_from_slice(&(self.arena.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.arena);
        fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        let data =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        ensure!(
            data.len() >= 8 && &data[0..4] == b"GOLS",
            "[strings] {} is not a string-counts file",
            path.display()
        );
        let len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        ensure!(data.len() == len + 8, "[strings] truncated string-counts file");
        let mut min = 1;
        self.merge_batch(&data[8..], &mut min);
        Ok(())
    }

    // arena field accessors

    fn next(&self, ofs: u32) -> u32 {
        self.get_u32(ofs as usize + OFS_NEXT)
    }

    fn hash(&self, ofs: u32) -> u32 {
        self.get_u32(ofs as usize + OFS_HASH)
    }

    pub fn total(&self, ofs: u32) -> u64 {
        self.get_u64(ofs as usize + OFS_TOTAL)
    }

    fn keys(&self, ofs: u32) -> u64 {
        self.get_u64(ofs as usize + OFS_KEYS)
    }

    fn string(&self, ofs: u32) -> &str {
        let len = self.get_u16(ofs as usize + OFS_LEN) as usize;
        let start = ofs as usize + HEADER_LEN;
        std::str::from_utf8(&self.arena[start..start + len]).expect("arena strings are UTF-8")
    }

    fn get_u16(&self, ofs: usize) -> u16 {
        u16::from_le_bytes(self.arena[ofs..ofs + 2].try_into().unwrap())
    }

    fn get_u32(&self, ofs: usize) -> u32 {
        u32::from_le_bytes(self.arena[ofs..ofs + 4].try_into().unwrap())
    }

    fn get_u64(&self, ofs: usize) -> u64 {
        u64::from_le_bytes(self.arena[ofs..ofs + 8].try_into().unwrap())
    }

    fn put_u16(&mut self, ofs: usize, v: u16) {
        self.arena[ofs..ofs + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, ofs: usize, v: u32) {
        self.arena[ofs..ofs + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, ofs: usize, v: u64) {
        self.arena[ofs..ofs + 8].copy_from_slice(&v.to_le_bytes());
    }
}

/// A decoded view of one counter record.
pub struct Counter<'a> {
    pub string: &'a str,
    pub hash: u32,
    pub total: u64,
    pub keys: u64,
    pub required: bool,
}

impl Counter<'_> {
    pub fn values(&self) -> u64 {
        self.total - self.keys
    }
}

fn empty_arena(limit: usize) -> Vec<u8> {
    let mut arena = Vec::with_capacity(limit.min(1 << 20));
    arena.resize(ARENA_BASE, 0);
    arena
}

fn gross_size(str_len: usize) -> usize {
    (HEADER_LEN + str_len + 3) & !3
}

fn iter_batch(arena: &[u8]) -> impl Iterator<Item = Counter<'_>> {
    let mut pos = ARENA_BASE.min(arena.len());
    std::iter::from_fn(move || {
        if pos >= arena.len() {
            return None;
        }
        let len = u16::from_le_bytes(arena[pos + OFS_LEN..pos + OFS_LEN + 2].try_into().unwrap())
            as usize;
        let c = Counter {
            string: std::str::from_utf8(&arena[pos + HEADER_LEN..pos + HEADER_LEN + len])
                .expect("arena strings are UTF-8"),
            hash: u32::from_le_bytes(arena[pos + OFS_HASH..pos + OFS_HASH + 4].try_into().unwrap()),
            total: u64::from_le_bytes(
                arena[pos + OFS_TOTAL..pos + OFS_TOTAL + 8].try_into().unwrap(),
            ),
            keys: u64::from_le_bytes(arena[pos + OFS_KEYS..pos + OFS_KEYS + 8].try_into().unwrap()),
            required: arena[pos + OFS_FLAGS] & FLAG_REQUIRED != 0,
        };
        pos += gross_size(len);
        Some(c)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_and_lookup() {
        let mut stats = StringStats::new(64, 1 << 16);
        let a = stats.counter("highway").unwrap();
        stats.add(a, 1, 0);
        stats.add(a, 1, 0);
        let b = stats.counter("residential").unwrap();
        stats.add(b, 0, 1);
        assert_eq!(stats.counter("highway"), Some(a));
        assert_eq!(stats.total(a), 2);
        let counters: Vec<_> = stats.iter().map(|c| (c.string.to_string(), c.total)).collect();
        assert_eq!(counters, vec![("highway".into(), 2), ("residential".into(), 1)]);
    }

    #[test]
    fn arena_exhaustion_returns_none() {
        let mut stats = StringStats::new(16, 128);
        let mut created = 0;
        for i in 0.. {
            match stats.counter(&format!("string-{i}")) {
                Some(_) => created += 1,
                None => break,
            }
        }
        assert!(created >= 1);
        assert!(created < 10);
        // existing counters can still be found
        assert!(stats.counter("string-0").is_some());
    }

    #[test]
    fn merge_culls_when_full() {
        let mut worker = StringStats::new(256, 1 << 16);
        for i in 0..100 {
            let ofs = worker.counter(&format!("rare-{i}")).unwrap();
            worker.add(ofs, 2, 0);
        }
        let common = worker.counter("common").unwrap();
        worker.add(common, 500, 500);
        let batch = worker.take_batch();
        assert_eq!(worker.counter_count(), 0);

        // an aggregator too small for all 101 strings must keep the common one
        let mut global = StringStats::new(256, 1 << 11);
        let mut min_count = 2;
        global.merge_batch(&batch, &mut min_count);
        assert!(min_count > 2, "cull must have triggered");
        let found: Vec<_> = global.iter().map(|c| c.string.to_string()).collect();
        assert!(found.contains(&"common".to_string()));
        let ofs = global.counter("common").unwrap();
        assert_eq!(global.total(ofs), 1000);
    }

    #[test]
    fn required_counters_survive_culls() {
        let mut stats = StringStats::new(64, 1 << 16);
        stats.add_required("outer");
        let ofs = stats.counter("filler").unwrap();
        stats.add(ofs, 1, 0);
        stats.cull(1000);
        let kept: Vec<_> = stats.iter().map(|c| (c.string.to_string(), c.required)).collect();
        assert_eq!(kept, vec![("outer".to_string(), true)]);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("string-counts.bin");
        let mut stats = StringStats::new(64, 1 << 16);
        let ofs = stats.counter("name").unwrap();
        stats.add(ofs, 7, 3);
        stats.save(&path).unwrap();

        let mut loaded = StringStats::new(64, 1 << 16);
        loaded.load(&path).unwrap();
        let ofs = loaded.counter("name").unwrap();
        assert_eq!(loaded.total(ofs), 10);
    }
}
