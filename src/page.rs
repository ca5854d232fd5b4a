//! Page layout and typed views over page buffers.
//!
//! Every page starts with a 16-byte header:
//!
//! ```text
//! [0..8)   pgno   u64
//! [8..10)  flags  u16   (PageFlags)
//! [10..12) count  u16   number of nodes
//! [12..14) lower  u16   end of the slot directory
//! [14..16) upper  u16   start of node data
//! ```
//!
//! Branch and leaf pages follow the header with a directory of `u16` node
//! offsets; nodes are packed from the end of the page downwards. Overflow
//! pages reuse bytes `[12..16)` for the chunk length and store the next page
//! of the chain at `[16..24)`.
//!
//! All integers are little-endian. Every accessor is bounds-checked and
//! reports `Error::Corrupted` instead of reading outside the page.

use std::convert::TryInto;

use crate::constants::{NodeFlags, PageFlags, MIN_KEYS};
use crate::error::{Error, Result};
use crate::types::PageNo;

pub(crate) const PAGE_HEADER_SIZE: usize = 16;
pub(crate) const SLOT_SIZE: usize = 2;
/// `ksize u16, flags u16, dsize u32`
pub(crate) const LEAF_NODE_HEADER: usize = 8;
/// `ksize u16, flags u16, child u64`
pub(crate) const BRANCH_NODE_HEADER: usize = 12;
pub(crate) const OVERFLOW_HEADER_SIZE: usize = 24;
const OVERFLOW_NEXT: usize = 16;

/// Largest leaf node kept inline; bigger values move to an overflow chain.
pub(crate) fn node_max(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / MIN_KEYS - SLOT_SIZE
}

/// Largest key the page layout can hold while keeping `MIN_KEYS` per page.
pub(crate) fn max_key_limit(page_size: usize) -> usize {
    node_max(page_size) - LEAF_NODE_HEADER - 8
}

/// Payload bytes carried by one overflow page.
pub(crate) fn overflow_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_HEADER_SIZE
}

/// Number of overflow pages a value of `len` bytes occupies.
pub(crate) fn overflow_pages_for(len: usize, page_size: usize) -> usize {
    len.div_ceil(overflow_capacity(page_size))
}

/// Whether a leaf entry with these sizes is stored inline.
pub(crate) fn fits_inline(key_len: usize, value_len: usize, page_size: usize) -> bool {
    LEAF_NODE_HEADER + key_len + value_len <= node_max(page_size)
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    buf.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(Error::Corrupted("page field out of bounds"))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    buf.get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(Error::Corrupted("page field out of bounds"))
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    buf.get(off..off + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(Error::Corrupted("page field out of bounds"))
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_header(buf: &mut [u8], pgno: PageNo, flags: PageFlags, count: u16, lower: u16, upper: u16) {
    put_u64(buf, 0, pgno);
    put_u16(buf, 8, flags.bits());
    put_u16(buf, 10, count);
    put_u16(buf, 12, lower);
    put_u16(buf, 14, upper);
}

/// Value half of a leaf entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafValue {
    Inline(Vec<u8>),
    /// First page of the chain and total value length
    Overflow { pgno: PageNo, len: u32 },
}

/// Borrowed form of [`LeafValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafRef<'a> {
    Inline(&'a [u8]),
    Overflow { pgno: PageNo, len: u32 },
}

impl LeafRef<'_> {
    pub fn to_owned(self) -> LeafValue {
        match self {
            LeafRef::Inline(v) => LeafValue::Inline(v.to_vec()),
            LeafRef::Overflow { pgno, len } => LeafValue::Overflow { pgno, len },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub key: Vec<u8>,
    pub value: LeafValue,
}

impl LeafEntry {
    pub fn encoded_size(&self) -> usize {
        let data = match &self.value {
            LeafValue::Inline(v) => v.len(),
            LeafValue::Overflow { .. } => 8,
        };
        LEAF_NODE_HEADER + self.key.len() + data
    }
}

/// Routing entry; the key of the first entry of a branch is always empty and
/// stands for "everything below the second key".
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BranchEntry {
    pub key: Vec<u8>,
    pub child: PageNo,
}

impl BranchEntry {
    pub fn encoded_size(&self) -> usize {
        BRANCH_NODE_HEADER + self.key.len()
    }
}

/// Decoded, owned contents of a branch or leaf page
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(Vec<LeafEntry>),
    Branch(Vec<BranchEntry>),
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(e) => e.len(),
            Node::Branch(e) => e.len(),
        }
    }

    /// Size of the page this node would encode to, header included
    pub fn encoded_size(&self) -> usize {
        let nodes: usize = match self {
            Node::Leaf(e) => e.iter().map(|e| e.encoded_size() + SLOT_SIZE).sum(),
            Node::Branch(e) => e.iter().map(|e| e.encoded_size() + SLOT_SIZE).sum(),
        };
        PAGE_HEADER_SIZE + nodes
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_size() <= page_size
    }

    /// Bytes of usable space in use, per mille
    pub fn fill(&self, page_size: usize) -> usize {
        (self.encoded_size() - PAGE_HEADER_SIZE) * 1000 / (page_size - PAGE_HEADER_SIZE)
    }

    #[cfg(test)]
    pub fn first_key(&self) -> Option<&[u8]> {
        match self {
            Node::Leaf(e) => e.first().map(|e| e.key.as_slice()),
            Node::Branch(e) => e.first().map(|e| e.key.as_slice()),
        }
    }

    /// Per-entry encoded sizes including the slot, used to pick split points
    pub fn entry_sizes(&self) -> Vec<usize> {
        match self {
            Node::Leaf(e) => e.iter().map(|e| e.encoded_size() + SLOT_SIZE).collect(),
            Node::Branch(e) => e.iter().map(|e| e.encoded_size() + SLOT_SIZE).collect(),
        }
    }

    /// Split before entry `at`, returning `(left, separator, right)`. For a
    /// branch the separator moves up and the right node's first key is cleared.
    pub fn split_at(self, at: usize) -> (Node, Vec<u8>, Node) {
        match self {
            Node::Leaf(mut entries) => {
                let right = entries.split_off(at);
                let sep = right[0].key.clone();
                (Node::Leaf(entries), sep, Node::Leaf(right))
            }
            Node::Branch(mut entries) => {
                let mut right = entries.split_off(at);
                let sep = std::mem::take(&mut right[0].key);
                (Node::Branch(entries), sep, Node::Branch(right))
            }
        }
    }

    /// Join `left`, the parent separator and `right` into one node
    pub fn concat(left: Node, sep: Vec<u8>, right: Node) -> Result<Node> {
        match (left, right) {
            (Node::Leaf(mut l), Node::Leaf(r)) => {
                l.extend(r);
                Ok(Node::Leaf(l))
            }
            (Node::Branch(mut l), Node::Branch(mut r)) => {
                if let Some(first) = r.first_mut() {
                    first.key = sep;
                }
                l.extend(r);
                Ok(Node::Branch(l))
            }
            _ => Err(Error::Corrupted("sibling pages have different kinds")),
        }
    }

    pub fn encode(&self, pgno: PageNo, page_size: usize) -> Box<[u8]> {
        debug_assert!(self.fits(page_size), "node does not fit in a page");
        let mut buf = vec![0u8; page_size].into_boxed_slice();
        let mut upper = page_size;
        let (flags, count) = match self {
            Node::Leaf(entries) => {
                for (i, e) in entries.iter().enumerate() {
                    upper -= e.encoded_size();
                    let off = upper;
                    put_u16(&mut buf, off, e.key.len() as u16);
                    let key_at = off + LEAF_NODE_HEADER;
                    buf[key_at..key_at + e.key.len()].copy_from_slice(&e.key);
                    let data_at = key_at + e.key.len();
                    match &e.value {
                        LeafValue::Inline(v) => {
                            put_u16(&mut buf, off + 2, 0);
                            put_u32(&mut buf, off + 4, v.len() as u32);
                            buf[data_at..data_at + v.len()].copy_from_slice(v);
                        }
                        LeafValue::Overflow { pgno, len } => {
                            put_u16(&mut buf, off + 2, NodeFlags::BIGDATA.bits());
                            put_u32(&mut buf, off + 4, *len);
                            put_u64(&mut buf, data_at, *pgno);
                        }
                    }
                    put_u16(&mut buf, PAGE_HEADER_SIZE + i * SLOT_SIZE, off as u16);
                }
                (PageFlags::LEAF, entries.len())
            }
            Node::Branch(entries) => {
                for (i, e) in entries.iter().enumerate() {
                    upper -= e.encoded_size();
                    let off = upper;
                    put_u16(&mut buf, off, e.key.len() as u16);
                    put_u16(&mut buf, off + 2, 0);
                    put_u64(&mut buf, off + 4, e.child);
                    let key_at = off + BRANCH_NODE_HEADER;
                    buf[key_at..key_at + e.key.len()].copy_from_slice(&e.key);
                    put_u16(&mut buf, PAGE_HEADER_SIZE + i * SLOT_SIZE, off as u16);
                }
                (PageFlags::BRANCH, entries.len())
            }
        };
        let lower = PAGE_HEADER_SIZE + count * SLOT_SIZE;
        write_header(&mut buf, pgno, flags, count as u16, lower as u16, upper as u16);
        buf
    }
}

/// Encode one page of an overflow chain
pub(crate) fn encode_overflow(pgno: PageNo, next: Option<PageNo>, chunk: &[u8], page_size: usize) -> Box<[u8]> {
    let mut buf = vec![0u8; page_size].into_boxed_slice();
    put_u64(&mut buf, 0, pgno);
    put_u16(&mut buf, 8, PageFlags::OVERFLOW.bits());
    put_u32(&mut buf, 12, chunk.len() as u32);
    put_u64(&mut buf, OVERFLOW_NEXT, next.unwrap_or(0));
    buf[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
    buf
}

/// Read-only view of one page
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < OVERFLOW_HEADER_SIZE {
            return Err(Error::Corrupted("page shorter than its header"));
        }
        Ok(Self { data })
    }

    #[cfg(test)]
    pub fn pgno(&self) -> Result<PageNo> {
        read_u64(self.data, 0)
    }

    pub fn flags(&self) -> Result<PageFlags> {
        Ok(PageFlags::from_bits_truncate(read_u16(self.data, 8)?))
    }

    pub fn count(&self) -> Result<usize> {
        Ok(read_u16(self.data, 10)? as usize)
    }

    pub fn is_leaf(&self) -> Result<bool> {
        Ok(self.flags()?.contains(PageFlags::LEAF))
    }

    /// Fails unless this is a branch or leaf page
    pub fn expect_tree_page(&self) -> Result<()> {
        let flags = self.flags()?;
        if flags.contains(PageFlags::LEAF) || flags.contains(PageFlags::BRANCH) {
            Ok(())
        } else {
            Err(Error::Corrupted("expected a branch or leaf page"))
        }
    }

    fn node_offset(&self, i: usize) -> Result<usize> {
        if i >= self.count()? {
            return Err(Error::Corrupted("node index out of range"));
        }
        let off = read_u16(self.data, PAGE_HEADER_SIZE + i * SLOT_SIZE)? as usize;
        if off < PAGE_HEADER_SIZE || off >= self.data.len() {
            return Err(Error::Corrupted("node offset outside page"));
        }
        Ok(off)
    }

    fn slice(&self, from: usize, len: usize) -> Result<&'a [u8]> {
        self.data
            .get(from..from + len)
            .ok_or(Error::Corrupted("node extends past page end"))
    }

    /// Key of node `i`, for both branch and leaf pages
    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        let off = self.node_offset(i)?;
        let ksize = read_u16(self.data, off)? as usize;
        let header = if self.is_leaf()? { LEAF_NODE_HEADER } else { BRANCH_NODE_HEADER };
        self.slice(off + header, ksize)
    }

    /// Key and value of leaf node `i`
    pub fn leaf(&self, i: usize) -> Result<(&'a [u8], LeafRef<'a>)> {
        let off = self.node_offset(i)?;
        let ksize = read_u16(self.data, off)? as usize;
        let flags = NodeFlags::from_bits_truncate(read_u16(self.data, off + 2)?);
        let dsize = read_u32(self.data, off + 4)?;
        let key = self.slice(off + LEAF_NODE_HEADER, ksize)?;
        let data_at = off + LEAF_NODE_HEADER + ksize;
        let value = if flags.contains(NodeFlags::BIGDATA) {
            LeafRef::Overflow { pgno: read_u64(self.data, data_at)?, len: dsize }
        } else {
            LeafRef::Inline(self.slice(data_at, dsize as usize)?)
        };
        Ok((key, value))
    }

    /// Child page of branch node `i`
    pub fn child(&self, i: usize) -> Result<PageNo> {
        let off = self.node_offset(i)?;
        read_u64(self.data, off + 4)
    }

    pub fn decode(&self) -> Result<Node> {
        let count = self.count()?;
        if self.is_leaf()? {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                let (key, value) = self.leaf(i)?;
                entries.push(LeafEntry { key: key.to_vec(), value: value.to_owned() });
            }
            Ok(Node::Leaf(entries))
        } else if self.flags()?.contains(PageFlags::BRANCH) {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                entries.push(BranchEntry { key: self.key(i)?.to_vec(), child: self.child(i)? });
            }
            Ok(Node::Branch(entries))
        } else {
            Err(Error::Corrupted("expected a branch or leaf page"))
        }
    }

    /// Payload and next link of an overflow page
    pub fn overflow(&self) -> Result<(&'a [u8], Option<PageNo>)> {
        if !self.flags()?.contains(PageFlags::OVERFLOW) {
            return Err(Error::Corrupted("expected an overflow page"));
        }
        let len = read_u32(self.data, 12)? as usize;
        let next = read_u64(self.data, OVERFLOW_NEXT)?;
        let chunk = self.slice(OVERFLOW_HEADER_SIZE, len)?;
        Ok((chunk, (next != 0).then_some(next)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;

    fn leaf(key: &[u8], value: &[u8]) -> LeafEntry {
        LeafEntry { key: key.to_vec(), value: LeafValue::Inline(value.to_vec()) }
    }

    #[test]
    fn leaf_page_decodes_what_was_encoded() {
        let node = Node::Leaf(vec![
            leaf(b"apple", b"red"),
            LeafEntry { key: b"big".to_vec(), value: LeafValue::Overflow { pgno: 42, len: 9000 } },
            leaf(b"pear", b""),
        ]);
        let buf = node.encode(7, PAGE_SIZE);
        let view = PageView::new(&buf).unwrap();
        assert_eq!(view.pgno().unwrap(), 7);
        assert_eq!(view.count().unwrap(), 3);
        assert_eq!(view.key(1).unwrap(), b"big");
        assert_eq!(view.leaf(1).unwrap().1, LeafRef::Overflow { pgno: 42, len: 9000 });
        assert_eq!(view.leaf(2).unwrap().1, LeafRef::Inline(b""));
        assert_eq!(view.decode().unwrap(), node);
    }

    #[test]
    fn branch_split_moves_separator_up() {
        let node = Node::Branch(vec![
            BranchEntry { key: vec![], child: 3 },
            BranchEntry { key: b"m".to_vec(), child: 4 },
            BranchEntry { key: b"t".to_vec(), child: 5 },
        ]);
        let buf = node.encode(9, PAGE_SIZE);
        let view = PageView::new(&buf).unwrap();
        assert_eq!(view.child(2).unwrap(), 5);
        assert_eq!(view.key(0).unwrap(), b"");

        let (left, sep, right) = node.clone().split_at(1);
        assert_eq!(sep, b"m");
        assert_eq!(right.first_key(), Some(&b""[..]));
        assert_eq!(Node::concat(left, sep, right).unwrap(), node);
    }

    #[test]
    fn corrupt_offsets_are_reported() {
        let node = Node::Leaf(vec![leaf(b"k", b"v")]);
        let mut buf = node.encode(2, PAGE_SIZE);
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 2].copy_from_slice(&(PAGE_SIZE as u16 - 1).to_le_bytes());
        let view = PageView::new(&buf).unwrap();
        assert!(matches!(view.leaf(0), Err(Error::Corrupted(_))));
        assert!(matches!(view.key(5), Err(Error::Corrupted(_))));
    }

    #[test]
    fn overflow_page_links_chain() {
        let buf = encode_overflow(11, Some(12), b"chunk", PAGE_SIZE);
        let view = PageView::new(&buf).unwrap();
        assert_eq!(view.overflow().unwrap(), (&b"chunk"[..], Some(12)));
        let last = encode_overflow(12, None, b"end", PAGE_SIZE);
        assert_eq!(PageView::new(&last).unwrap().overflow().unwrap().1, None);
    }

    #[test]
    fn page_derived_limits() {
        assert_eq!(node_max(PAGE_SIZE), 2038);
        assert!(max_key_limit(PAGE_SIZE) >= 511);
        assert!(fits_inline(10, 2000, PAGE_SIZE));
        assert!(!fits_inline(10, 2030, PAGE_SIZE));
        assert_eq!(overflow_pages_for(overflow_capacity(PAGE_SIZE) + 1, PAGE_SIZE), 2);
    }
}
