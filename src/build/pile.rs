//! The pile file: one growable scratch file holding an append-only byte
//! stream per tile. Pages are chained through a next-page word at the page
//! start; each pile gets a preallocated contiguous run of pages and spills
//! to the file tail when the estimate was short.
//!
//! Appends are serialized by the single output thread; loads may run
//! concurrently from worker threads as long as they target piles that are
//! not currently being appended to (the phase engines guarantee that).

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use parking_lot::Mutex;

pub const PAGE_SIZE: u64 = 16 * 1024;
const PAGE_HEADER: u64 = 8; // next-page number
const MAGIC: &[u8; 4] = b"GOLP";
const DIR_ENTRY_SIZE: u64 = 40;
const HEADER_SIZE: u64 = 32;

#[derive(Copy, Clone, Default)]
struct PileEntry {
    first_page: u64,
    last_page: u64,
    /// bytes used in the last page, including its header
    last_used: u32,
    total_bytes: u64,
    next_reserved: u64,
    reserved_remaining: u32,
}

pub struct PileFile {
    file: File,
    page_size: u64,
    /// entries are 1-based like piles; slot 0 is unused
    dir: Mutex<Dir>,
}

struct Dir {
    entries: Vec<PileEntry>,
    page_count: u64,
}

impl PileFile {
    pub fn create(path: &Path, pile_count: u32, page_size: u64) -> Result<PileFile> {
        debug_assert!(page_size >= 64 && page_size.is_power_of_two());
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let data_base = 1 + dir_pages(pile_count, page_size);
        let pf = PileFile {
            file,
            page_size,
            dir: Mutex::new(Dir {
                entries: vec![PileEntry::default(); pile_count as usize + 1],
                page_count: data_base,
            }),
        };
        pf.sync_directory()?;
        Ok(pf)
    }

    pub fn open_existing(path: &Path) -> Result<PileFile> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        ensure!(&header[0..4] == MAGIC, "[pile] {} is not a pile file", path.display());
        let page_size = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let pile_count = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let page_count = u64::from_le_bytes(header[16..24].try_into().unwrap());
        ensure!(
            page_size.is_power_of_two() && page_size >= 64,
            "[pile] bad page size in {}",
            path.display()
        );
        let mut entries = vec![PileEntry::default(); pile_count as usize + 1];
        let mut buf = vec![0u8; (pile_count as u64 * DIR_ENTRY_SIZE) as usize];
        file.read_exact_at(&mut buf, page_size)
            .context("[pile] truncated pile directory")?;
        for (i, entry) in entries.iter_mut().enumerate().skip(1) {
            let rec = &buf[(i - 1) * DIR_ENTRY_SIZE as usize..];
            entry.first_page = u64::from_le_bytes(rec[0..8].try_into().unwrap());
            entry.last_page = u64::from_le_bytes(rec[8..16].try_into().unwrap());
            entry.last_used = u32::from_le_bytes(rec[16..20].try_into().unwrap());
            entry.total_bytes = u64::from_le_bytes(rec[20..28].try_into().unwrap());
            entry.next_reserved = u64::from_le_bytes(rec[28..36].try_into().unwrap());
            entry.reserved_remaining = u32::from_le_bytes(rec[36..40].try_into().unwrap());
        }
        Ok(PileFile { file, page_size, dir: Mutex::new(Dir { entries, page_count }) })
    }

    pub fn pile_count(&self) -> u32 {
        (self.dir.lock().entries.len() - 1) as u32
    }

    /// Reserve a contiguous page run sized for `estimated_bytes`. Must be
    /// called at most once per pile, before the first append.
    pub fn preallocate(&self, pile: u32, estimated_bytes: u64) {
        let payload = self.page_size - PAGE_HEADER;
        let pages = estimated_bytes.div_ceil(payload).max(1);
        let mut dir = self.dir.lock();
        let start = dir.page_count;
        dir.page_count += pages;
        let e = &mut dir.entries[pile as usize];
        debug_assert!(e.first_page == 0 && e.reserved_remaining == 0);
        e.next_reserved = start;
        e.reserved_remaining = pages as u32;
    }

    /// Append `data` to the pile; atomic with respect to `load` because
    /// the directory entry is only updated under the lock.
    pub fn append(&self, pile: u32, data: &[u8]) -> Result<()> {
        debug_assert!(pile >= 1);
        let mut dir = self.dir.lock();
        let mut e = dir.entries[pile as usize];
        if e.first_page == 0 {
            let page = take_page(&mut e, &mut dir.page_count);
            e.first_page = page;
            e.last_page = page;
            e.last_used = PAGE_HEADER as u32;
        }
        let mut pos = 0;
        while pos < data.len() {
            let room = (self.page_size - e.last_used as u64) as usize;
            if room == 0 {
                let page = take_page(&mut e, &mut dir.page_count);
                self.file
                    .write_all_at(&page.to_le_bytes(), e.last_page * self.page_size)
                    .context("[pile] failed to chain page")?;
                e.last_page = page;
                e.last_used = PAGE_HEADER as u32;
                continue;
            }
            let n = room.min(data.len() - pos);
            let ofs = e.last_page * self.page_size + e.last_used as u64;
            self.file
                .write_all_at(&data[pos..pos + n], ofs)
                .context("[pile] write failed")?;
            e.last_used += n as u32;
            e.total_bytes += n as u64;
            pos += n;
        }
        dir.entries[pile as usize] = e;
        Ok(())
    }

    /// Read the pile's full byte stream.
    pub fn load(&self, pile: u32) -> Result<Vec<u8>> {
        let e = self.dir.lock().entries[pile as usize];
        let mut out = Vec::with_capacity(e.total_bytes as usize);
        if e.first_page == 0 {
            return Ok(out);
        }
        let mut page = e.first_page;
        let mut buf = vec![0u8; self.page_size as usize];
        loop {
            self.file
                .read_exact_at(&mut buf, page * self.page_size)
                .context("[pile] read failed")?;
            if page == e.last_page {
                out.extend_from_slice(&buf[PAGE_HEADER as usize..e.last_used as usize]);
                break;
            }
            out.extend_from_slice(&buf[PAGE_HEADER as usize..]);
            page = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            debug_assert!(page != 0, "broken page chain");
        }
        debug_assert_eq!(out.len() as u64, e.total_bytes);
        Ok(out)
    }

    pub fn bytes_used(&self, pile: u32) -> u64 {
        self.dir.lock().entries[pile as usize].total_bytes
    }

    /// Persist the header and pile directory (called at phase boundaries
    /// so an interrupted build can resume).
    pub fn sync_directory(&self) -> Result<()> {
        let dir = self.dir.lock();
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&((dir.entries.len() - 1) as u32).to_le_bytes());
        header[8..16].copy_from_slice(&self.page_size.to_le_bytes());
        header[16..24].copy_from_slice(&dir.page_count.to_le_bytes());
        self.file.write_all_at(&header, 0).context("[pile] header write failed")?;
        let mut buf = vec![0u8; (dir.entries.len() - 1) * DIR_ENTRY_SIZE as usize];
        for (i, e) in dir.entries.iter().enumerate().skip(1) {
            let rec = &mut buf[(i - 1) * DIR_ENTRY_SIZE as usize..i * DIR_ENTRY_SIZE as usize];
            rec[0..8].copy_from_slice(&e.first_page.to_le_bytes());
            rec[8..16].copy_from_slice(&e.last_page.to_le_bytes());
            rec[16..20].copy_from_slice(&e.last_used.to_le_bytes());
            rec[20..28].copy_from_slice(&e.total_bytes.to_le_bytes());
            rec[28..36].copy_from_slice(&e.next_reserved.to_le_bytes());
            rec[36..40].copy_from_slice(&e.reserved_remaining.to_le_bytes());
        }
        self.file.write_all_at(&buf, self.page_size).context("[pile] directory write failed")
    }
}

fn take_page(e: &mut PileEntry, page_count: &mut u64) -> u64 {
    if e.reserved_remaining > 0 {
        let page = e.next_reserved;
        e.next_reserved += 1;
        e.reserved_remaining -= 1;
        page
    } else {
        let page = *page_count;
        *page_count += 1;
        page
    }
}

fn dir_pages(pile_count: u32, page_size: u64) -> u64 {
    (pile_count as u64 * DIR_ENTRY_SIZE).div_ceil(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_file(pile_count: u32) -> (tempfile::TempDir, PileFile) {
        let dir = tempfile::tempdir().unwrap();
        let pf = PileFile::create(&dir.path().join("features.bin"), pile_count, 256).unwrap();
        (dir, pf)
    }

    #[test]
    fn append_and_load_round_trip() {
        let (_dir, pf) = test_file(4);
        pf.preallocate(1, 100);
        pf.preallocate(2, 100);
        pf.append(1, b"hello ").unwrap();
        pf.append(2, b"other pile").unwrap();
        pf.append(1, b"world").unwrap();
        assert_eq!(pf.load(1).unwrap(), b"hello world");
        assert_eq!(pf.load(2).unwrap(), b"other pile");
        assert_eq!(pf.load(3).unwrap(), b"");
    }

    #[test]
    fn appends_spill_across_pages() {
        let (_dir, pf) = test_file(2);
        pf.preallocate(1, 10); // one reserved page, will overflow
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        pf.append(1, &payload[..1000]).unwrap();
        pf.append(1, &payload[1000..]).unwrap();
        assert_eq!(pf.load(1).unwrap(), payload);
        assert_eq!(pf.bytes_used(1), 2000);
    }

    #[test]
    fn preallocated_runs_are_contiguous_and_independent() {
        let (_dir, pf) = test_file(3);
        pf.preallocate(1, 1000);
        pf.preallocate(2, 1000);
        pf.preallocate(3, 1000);
        // interleave appends; each pile must keep its own stream
        for _round in 0..50 {
            for pile in 1..=3u32 {
                pf.append(pile, &[pile as u8; 64]).unwrap();
            }
        }
        for pile in 1..=3u32 {
            let data = pf.load(pile).unwrap();
            assert_eq!(data.len(), 50 * 64);
            assert!(data.iter().all(|&b| b == pile as u8));
        }
    }

    #[test]
    fn directory_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.bin");
        {
            let pf = PileFile::create(&path, 2, 256).unwrap();
            pf.preallocate(1, 10);
            pf.append(1, b"persisted").unwrap();
            pf.sync_directory().unwrap();
        }
        let pf = PileFile::open_existing(&path).unwrap();
        assert_eq!(pf.pile_count(), 2);
        assert_eq!(pf.load(1).unwrap(), b"persisted");
        pf.append(1, b" more").unwrap();
        assert_eq!(pf.load(1).unwrap(), b"persisted more");
    }
}
