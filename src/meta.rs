use log::warn;

use crate::constants::{PageFlags, DATA_VERSION, MDB_MAGIC, META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::page::{put_u64, read_u64, write_header, PAGE_HEADER_SIZE};
use crate::types::{PageNo, Stat, TxnId};

/// Encoded size of a [`TreeInfo`]
pub(crate) const TREE_INFO_SIZE: usize = 48;

const MAGIC_AT: usize = PAGE_HEADER_SIZE;
const VERSION_AT: usize = MAGIC_AT + 4;
const PAGE_SIZE_AT: usize = VERSION_AT + 4;
const MAP_SIZE_AT: usize = PAGE_SIZE_AT + 4 + 4;
const LAST_PGNO_AT: usize = MAP_SIZE_AT + 8;
const TXN_ID_AT: usize = LAST_PGNO_AT + 8;
const CATALOG_AT: usize = TXN_ID_AT + 8;
const FREELIST_AT: usize = CATALOG_AT + TREE_INFO_SIZE;
const CHECKSUM_AT: usize = FREELIST_AT + TREE_INFO_SIZE;

/// Tree descriptor matching MDB_db; stored in the meta page for the catalog
/// and freelist trees and in catalog entries for user tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TreeInfo {
    /// Root page number, 0 for a tree without pages
    pub root: PageNo,
    /// Depth of B-tree; a lone leaf has depth 1
    pub depth: u32,
    /// Persistent table flags
    pub flags: u32,
    /// Number of data entries
    pub entries: u64,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
}

impl TreeInfo {
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.root);
        buf[8..12].copy_from_slice(&self.depth.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        put_u64(buf, 16, self.entries);
        put_u64(buf, 24, self.branch_pages);
        put_u64(buf, 32, self.leaf_pages);
        put_u64(buf, 40, self.overflow_pages);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TREE_INFO_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TREE_INFO_SIZE {
            return Err(Error::Corrupted("tree descriptor too short"));
        }
        let half = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Ok(Self {
            root: read_u64(buf, 0)?,
            depth: half(8),
            flags: half(12),
            entries: read_u64(buf, 16)?,
            branch_pages: read_u64(buf, 24)?,
            leaf_pages: read_u64(buf, 32)?,
            overflow_pages: read_u64(buf, 40)?,
        })
    }

    pub fn stat(&self, page_size: usize) -> Stat {
        Stat {
            page_size: page_size as u32,
            depth: self.depth,
            branch_pages: self.branch_pages,
            leaf_pages: self.leaf_pages,
            overflow_pages: self.overflow_pages,
            entries: self.entries,
        }
    }
}

/// Contents of a meta page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Meta {
    /// Page size the file was created with
    pub page_size: u32,
    /// Size of mmap region configured when this meta was written
    pub map_size: u64,
    /// Last used page in the datafile
    pub last_pgno: PageNo,
    /// txnid that committed this page
    pub txn_id: TxnId,
    pub catalog: TreeInfo,
    pub freelist: TreeInfo,
}

impl Meta {
    /// Meta of a freshly created file: nothing but the two meta pages
    pub fn initial(map_size: usize) -> Self {
        Self {
            page_size: PAGE_SIZE as u32,
            map_size: map_size as u64,
            last_pgno: META_PAGES as PageNo - 1,
            txn_id: 0,
            catalog: TreeInfo::default(),
            freelist: TreeInfo::default(),
        }
    }

    /// Meta slot a transaction with this id is published in
    pub fn slot(txn_id: TxnId) -> usize {
        (txn_id % META_PAGES as u64) as usize
    }

    pub fn encode(&self, slot: usize) -> Box<[u8]> {
        let mut buf = vec![0u8; self.page_size as usize].into_boxed_slice();
        write_header(&mut buf, slot as PageNo, PageFlags::META, 0, 0, 0);
        buf[MAGIC_AT..MAGIC_AT + 4].copy_from_slice(&MDB_MAGIC.to_le_bytes());
        buf[VERSION_AT..VERSION_AT + 4].copy_from_slice(&DATA_VERSION.to_le_bytes());
        buf[PAGE_SIZE_AT..PAGE_SIZE_AT + 4].copy_from_slice(&self.page_size.to_le_bytes());
        put_u64(&mut buf, MAP_SIZE_AT, self.map_size);
        put_u64(&mut buf, LAST_PGNO_AT, self.last_pgno);
        put_u64(&mut buf, TXN_ID_AT, self.txn_id);
        self.catalog.encode_into(&mut buf[CATALOG_AT..FREELIST_AT]);
        self.freelist.encode_into(&mut buf[FREELIST_AT..CHECKSUM_AT]);
        let crc = crc32fast::hash(&buf[..CHECKSUM_AT]);
        buf[CHECKSUM_AT..CHECKSUM_AT + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CHECKSUM_AT + 4 {
            return Err(Error::Corrupted("meta page truncated"));
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        if word(CHECKSUM_AT) != crc32fast::hash(&buf[..CHECKSUM_AT]) {
            return Err(Error::Corrupted("meta checksum mismatch"));
        }
        if word(MAGIC_AT) != MDB_MAGIC {
            return Err(Error::Corrupted("bad meta magic"));
        }
        let version = word(VERSION_AT);
        if version != DATA_VERSION {
            return Err(Error::VersionMismatch { found: version, expected: DATA_VERSION });
        }
        let page_size = word(PAGE_SIZE_AT);
        if page_size as usize != PAGE_SIZE {
            return Err(Error::Corrupted("unsupported page size"));
        }
        Ok(Self {
            page_size,
            map_size: read_u64(buf, MAP_SIZE_AT)?,
            last_pgno: read_u64(buf, LAST_PGNO_AT)?,
            txn_id: read_u64(buf, TXN_ID_AT)?,
            catalog: TreeInfo::decode(&buf[CATALOG_AT..FREELIST_AT])?,
            freelist: TreeInfo::decode(&buf[FREELIST_AT..CHECKSUM_AT])?,
        })
    }

    /// Pick the authoritative meta page out of both slots: the valid one with
    /// the higher transaction id. Returns the slot index along with the meta.
    pub fn select(slots: [&[u8]; META_PAGES]) -> Result<(usize, Meta)> {
        match (Meta::decode(slots[0]), Meta::decode(slots[1])) {
            (Ok(a), Ok(b)) => Ok(if b.txn_id > a.txn_id { (1, b) } else { (0, a) }),
            (Ok(a), Err(e)) => {
                warn!("meta slot 1 is invalid ({}), using slot 0 at txn {}", e, a.txn_id);
                Ok((0, a))
            }
            (Err(e), Ok(b)) => {
                warn!("meta slot 0 is invalid ({}), using slot 1 at txn {}", e, b.txn_id);
                Ok((1, b))
            }
            (Err(e @ Error::VersionMismatch { .. }), Err(_)) | (Err(_), Err(e @ Error::VersionMismatch { .. })) => Err(e),
            (Err(_), Err(_)) => Err(Error::Corrupted("no valid meta page")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(txn_id: TxnId) -> Meta {
        Meta {
            txn_id,
            last_pgno: 10 + txn_id,
            catalog: TreeInfo { root: 4, depth: 1, leaf_pages: 1, entries: 1, ..TreeInfo::default() },
            ..Meta::initial(1 << 20)
        }
    }

    #[test]
    fn encode_decode_meta() {
        let m = meta(7);
        let buf = m.encode(Meta::slot(7));
        assert_eq!(Meta::decode(&buf).unwrap(), m);
        assert_eq!(&buf[0..8], &1u64.to_le_bytes());
    }

    #[test]
    fn select_prefers_higher_txn() {
        let a = meta(4).encode(0);
        let b = meta(5).encode(1);
        let (slot, m) = Meta::select([&a, &b]).unwrap();
        assert_eq!((slot, m.txn_id), (1, 5));

        let fresh = Meta::initial(1 << 20);
        let (slot, _) = Meta::select([&fresh.encode(0), &fresh.encode(1)]).unwrap();
        assert_eq!(slot, 0);
    }

    #[test]
    fn select_falls_back_on_bad_checksum() {
        let a = meta(4).encode(0);
        let mut b = meta(5).encode(1);
        b[LAST_PGNO_AT] ^= 0xff;
        let (slot, m) = Meta::select([&a, &b]).unwrap();
        assert_eq!((slot, m.txn_id), (0, 4));

        let mut a = a;
        a[TXN_ID_AT] ^= 0x01;
        assert!(matches!(Meta::select([&a, &b]), Err(Error::Corrupted(_))));
    }

    #[test]
    fn tree_info_round_trip() {
        let info = TreeInfo { root: 9, depth: 3, flags: 2, entries: 1000, branch_pages: 4, leaf_pages: 30, overflow_pages: 2 };
        assert_eq!(TreeInfo::decode(&info.to_bytes()).unwrap(), info);
        assert_eq!(info.stat(4096).leaf_pages, 30);
    }
}
