use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use memmap2::{Mmap, MmapOptions};

use crate::constants::META_PAGES;
use crate::error::{Error, Result};
use crate::page::PageView;
use crate::types::PageNo;

/// Data file plus the read-only mappings handed to snapshots.
///
/// Pages reach the file through positional writes; the mapping is only ever
/// read. A mapping covers the file length at the time it was created, so it
/// stays valid for every page of the snapshot it was published with.
#[derive(Debug)]
pub(crate) struct PageStore {
    file: File,
    path: PathBuf,
    page_size: usize,
    /// Upper bound for the file length
    map_size: u64,
    /// Current file length in bytes
    len: AtomicU64,
}

impl PageStore {
    pub fn open(path: &Path, mode: u32, read_only: bool, page_size: usize, map_size: usize) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true).create(true).mode(mode);
        }
        let file = options.open(path)?;
        let len = file.metadata()?.len();
        debug!("opened data file {} ({} bytes)", path.display(), len);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            map_size: (map_size as u64).max(len),
            len: AtomicU64::new(len),
        })
    }

    /// Largest file length allowed; never below the length found on open
    pub fn map_size(&self) -> u64 {
        self.map_size
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Number of whole pages the file holds
    #[cfg(test)]
    pub fn pages(&self) -> u64 {
        self.len() / self.page_size as u64
    }

    /// Map the whole file read-only
    pub fn map(&self) -> Result<Arc<Mmap>> {
        let len = self.len() as usize;
        if len < META_PAGES * self.page_size {
            return Err(Error::Corrupted("data file shorter than its meta pages"));
        }
        // SAFETY: the file is only modified through this store. Pages visible
        // to a snapshot are never rewritten while the snapshot is alive.
        let map = unsafe { MmapOptions::new().len(len).map(&self.file)? };
        Ok(Arc::new(map))
    }

    /// Grow the file so it holds at least `pages` pages. The file doubles
    /// until it reaches the map size. Returns whether the file grew.
    pub fn ensure_pages(&self, pages: u64) -> Result<bool> {
        let needed = pages * self.page_size as u64;
        let current = self.len();
        if needed <= current {
            return Ok(false);
        }
        if needed > self.map_size {
            return Err(Error::MapExhausted);
        }
        let page = self.page_size as u64;
        let doubled = (current * 2).min(self.map_size) / page * page;
        let new_len = needed.max(doubled);
        self.file.set_len(new_len)?;
        self.len.store(new_len, Ordering::Release);
        debug!("grew {} from {} to {} bytes", self.path.display(), current, new_len);
        Ok(true)
    }

    pub fn write_page(&self, pgno: PageNo, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, pgno * self.page_size as u64)?;
        Ok(())
    }

    /// Write a batch of pages, merging runs of consecutive page numbers into
    /// single writes. `pages` must be sorted by page number.
    pub fn write_pages(&self, pages: &[(PageNo, &[u8])]) -> Result<()> {
        let mut run: Vec<u8> = Vec::new();
        let mut run_start = 0;
        let mut run_next = 0;
        for &(pgno, data) in pages {
            if !run.is_empty() && pgno != run_next {
                self.write_page(run_start, &run)?;
                trace!("wrote pages {}..{}", run_start, run_next);
                run.clear();
            }
            if run.is_empty() {
                run_start = pgno;
            }
            run.extend_from_slice(data);
            run_next = pgno + 1;
        }
        if !run.is_empty() {
            self.write_page(run_start, &run)?;
            trace!("wrote pages {}..{}", run_start, run_next);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn read_page(&self, pgno: PageNo) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        self.file.read_exact_at(&mut buf, pgno * self.page_size as u64)?;
        Ok(buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Resolve a committed page of a snapshot
pub(crate) fn committed_page(map: &Mmap, pgno: PageNo, page_size: usize, last_pgno: PageNo) -> Result<PageView<'_>> {
    if pgno < META_PAGES as PageNo || pgno > last_pgno {
        return Err(Error::Corrupted("page number outside the snapshot"));
    }
    let start = pgno as usize * page_size;
    let data = map
        .get(start..start + page_size)
        .ok_or(Error::Corrupted("page beyond the end of the map"))?;
    PageView::new(data)
}
