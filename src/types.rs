use std::cmp::Ordering;

/// Page number inside the data file
pub type PageNo = u64;

/// Transaction id; the id of a snapshot is the id of the commit that produced it
pub type TxnId = u64;

/// Key ordering used by a table
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Tree statistics matching MDB_stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub page_size: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
}

/// Environment information matching MDB_envinfo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    /// Maximum size of the data file
    pub map_size: usize,
    /// Current length of the data file
    pub file_size: u64,
    /// Last page in use by the latest snapshot
    pub last_pgno: PageNo,
    /// Id of the latest committed transaction
    pub last_txn_id: TxnId,
    pub max_readers: u32,
    pub num_readers: u32,
}

/// Unsigned lexicographic byte order
pub(crate) fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Lexicographic order of the reversed byte strings
pub(crate) fn compare_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_order_compares_suffixes() {
        assert_eq!(compare_reverse(b"ba", b"ab"), Ordering::Less);
        assert_eq!(compare_reverse(b"a", b"ba"), Ordering::Less);
        assert_eq!(compare_reverse(b"xy", b"xy"), Ordering::Equal);
        assert_eq!(compare_bytes(b"ba", b"ab"), Ordering::Greater);
    }
}
