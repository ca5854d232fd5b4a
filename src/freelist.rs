//! Page allocation and the freelist tree.
//!
//! Pages released by a commit are recorded in the freelist tree under the id
//! of that commit. A write transaction only reclaims records strictly older
//! than the oldest reader snapshot, so no page a reader may still reach is
//! ever handed out again.

use std::convert::TryInto;

use log::trace;

use crate::btree;
use crate::constants::WriteFlags;
use crate::cursor::RawCursor;
use crate::error::{Error, Result};
use crate::meta::TreeInfo;
use crate::midl::PageList;
use crate::transaction::WritePages;
use crate::types::{compare_bytes, PageNo, TxnId};

/// Page numbers per freelist record, small enough to stay inline in a leaf
const IDS_PER_RECORD: usize = 250;

fn record_key(txn_id: TxnId, chunk: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&txn_id.to_be_bytes());
    key[8..].copy_from_slice(&chunk.to_be_bytes());
    key
}

fn record_txn(key: &[u8]) -> Result<TxnId> {
    key.get(..8)
        .and_then(|b| b.try_into().ok())
        .map(TxnId::from_be_bytes)
        .ok_or(Error::Corrupted("malformed freelist key"))
}

fn encode_ids(ids: &[PageNo]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_le_bytes()).collect()
}

fn decode_ids(value: &[u8]) -> Result<Vec<PageNo>> {
    if value.len() % 8 != 0 {
        return Err(Error::Corrupted("malformed freelist record"));
    }
    Ok(value
        .chunks_exact(8)
        .map(|c| PageNo::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Page allocator of one write transaction
#[derive(Debug)]
pub(crate) struct PageAllocator {
    /// First page never handed out
    next_pgno: PageNo,
    /// Pages at or beyond this number do not fit in the map
    max_pgno: PageNo,
    /// Pages reclaimed from the freelist
    pool: PageList,
    /// Pages allocated and released again by this transaction
    loose: PageList,
    /// Committed pages released by this transaction
    freed: Vec<PageNo>,
    /// Pages set aside for writing the freelist itself
    reserve: PageList,
    /// Set while the freelist is saved; `freed` then only grows
    frozen: bool,
}

impl PageAllocator {
    pub fn new(last_pgno: PageNo, max_pgno: PageNo) -> Self {
        Self {
            next_pgno: last_pgno + 1,
            max_pgno,
            pool: PageList::new(),
            loose: PageList::new(),
            freed: Vec::new(),
            reserve: PageList::new(),
            frozen: false,
        }
    }

    pub fn alloc(&mut self) -> Result<PageNo> {
        let reused = if self.frozen {
            self.reserve.pop_lowest()
        } else {
            self.loose.pop_lowest().or_else(|| self.pool.pop_lowest())
        };
        if let Some(pgno) = reused {
            trace!("reusing page {}", pgno);
            return Ok(pgno);
        }
        if self.next_pgno >= self.max_pgno {
            return Err(Error::MapExhausted);
        }
        self.next_pgno += 1;
        Ok(self.next_pgno - 1)
    }

    /// Give a page back. Pages this transaction allocated can be reused at
    /// once; committed pages wait for the freelist.
    pub fn release(&mut self, pgno: PageNo, dirty: bool) {
        trace!("freeing page {} (dirty: {})", pgno, dirty);
        if dirty && !self.frozen {
            self.loose.insert(pgno);
        } else {
            self.freed.push(pgno);
        }
    }

    pub fn available(&self) -> u64 {
        let fresh = self.max_pgno.saturating_sub(self.next_pgno);
        if self.frozen {
            fresh + self.reserve.len() as u64
        } else {
            fresh + (self.loose.len() + self.pool.len()) as u64
        }
    }

    /// Last page the file has to hold once this transaction commits
    pub fn last_pgno(&self) -> PageNo {
        self.next_pgno - 1
    }

    /// Set aside up to `reserve` reusable pages for the freelist update and
    /// move every other reusable page into `freed`
    fn freeze(&mut self, reserve: usize) {
        while self.reserve.len() < reserve {
            match self.loose.pop_lowest().or_else(|| self.pool.pop_lowest()) {
                Some(pgno) => self.reserve.insert(pgno),
                None => break,
            }
        }
        let pool = self.pool.take();
        let loose = self.loose.take();
        self.freed.extend(pool.into_iter().rev());
        self.freed.extend(loose.into_iter().rev());
        self.frozen = true;
    }

    /// Hand unused reserved pages over to `freed`
    fn unreserve(&mut self) -> usize {
        let reserve = self.reserve.take();
        let count = reserve.len();
        self.freed.extend(reserve.into_iter().rev());
        count
    }
}

/// Move every record older than `oldest` from the freelist tree into the
/// allocator's pool. With no reader active every record is reclaimed.
pub(crate) fn reclaim(pages: &mut WritePages<'_>, freelist: &mut TreeInfo, oldest: Option<TxnId>) -> Result<usize> {
    let limit = oldest.unwrap_or(TxnId::MAX);
    let mut keys = Vec::new();
    let mut ids = Vec::new();
    let mut cursor = RawCursor::new();
    let mut more = cursor.first(&*pages, freelist)?;
    while more {
        let (key, value) = cursor
            .current(&*pages)?
            .ok_or(Error::Corrupted("freelist cursor lost its entry"))?;
        if record_txn(&key)? >= limit {
            break;
        }
        ids.extend(decode_ids(&value)?);
        keys.push(key);
        more = cursor.next(&*pages, freelist)?;
    }
    pages.alloc.pool.merge(&ids);
    for key in &keys {
        btree::delete(pages, freelist, compare_bytes, key)?;
    }
    if !keys.is_empty() {
        trace!("reclaimed {} pages from {} freelist records", ids.len(), keys.len());
    }
    Ok(ids.len())
}

/// Record every page that is free once this transaction commits under
/// `txn_id`. Writing records can release further freelist pages, so this
/// loops until the recorded list stops growing. The pages the freelist tree
/// needs come from a reserve taken out of the reusable pages beforehand;
/// whatever is left of the reserve is recorded too.
pub(crate) fn save(pages: &mut WritePages<'_>, freelist: &mut TreeInfo, txn_id: TxnId) -> Result<usize> {
    let alloc = &*pages.alloc;
    let free = alloc.freed.len() + alloc.pool.len() + alloc.loose.len();
    let records = free / IDS_PER_RECORD + 2;
    pages.alloc.freeze(records * 2 * (freelist.depth as usize + 1));

    let mut written = 0;
    let mut chunk = 0u32;
    loop {
        while written < pages.alloc.freed.len() {
            let end = (written + IDS_PER_RECORD).min(pages.alloc.freed.len());
            let value = encode_ids(&pages.alloc.freed[written..end]);
            btree::put(pages, freelist, compare_bytes, &record_key(txn_id, chunk), &value, WriteFlags::empty())?;
            trace!("saved freelist record {}/{} with {} pages", txn_id, chunk, end - written);
            written = end;
            chunk += 1;
        }
        if pages.alloc.unreserve() == 0 {
            return Ok(written);
        }
    }
}
