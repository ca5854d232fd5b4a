use crate::btree::{branch_index, leaf_search, read_value, PageReader};
use crate::error::{Error, Result};
use crate::meta::TreeInfo;
use crate::transaction::TxnPages;
use crate::types::{Comparator, PageNo};

/// Where a cursor stands relative to the entries of its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Not positioned yet
    Unset,
    /// On the entry at the top of the stack
    Valid,
    /// Moved past the last entry
    Eof,
    /// Moved before the first entry
    BeforeFirst,
}

/// Tree cursor independent of any transaction type. It keeps the path from
/// the root to the current leaf and re-resolves pages through the page
/// source on every move.
#[derive(Debug, Clone)]
pub(crate) struct RawCursor {
    /// (page, index) from the root to the leaf
    stack: Vec<(PageNo, usize)>,
    pos: Position,
}

impl RawCursor {
    pub fn new() -> Self {
        Self { stack: Vec::new(), pos: Position::Unset }
    }

    /// Descend from `pgno` along the leftmost or rightmost edge.
    /// Returns whether the leaf reached holds any entry.
    fn descend_edge<R: PageReader + ?Sized>(&mut self, r: &R, mut pgno: PageNo, last: bool, depth: u32) -> Result<bool> {
        loop {
            if self.stack.len() >= depth as usize {
                return Err(Error::Corrupted("tree deeper than its recorded depth"));
            }
            let view = r.page(pgno)?;
            view.expect_tree_page()?;
            let count = view.count()?;
            if view.is_leaf()? {
                self.stack.push((pgno, if last { count.saturating_sub(1) } else { 0 }));
                return Ok(count > 0);
            }
            if count == 0 {
                return Err(Error::Corrupted("empty branch page"));
            }
            let idx = if last { count - 1 } else { 0 };
            self.stack.push((pgno, idx));
            pgno = view.child(idx)?;
        }
    }

    pub fn first<R: PageReader + ?Sized>(&mut self, r: &R, info: &TreeInfo) -> Result<bool> {
        self.stack.clear();
        if info.root != 0 && self.descend_edge(r, info.root, false, info.depth)? {
            self.pos = Position::Valid;
            return Ok(true);
        }
        self.pos = Position::Eof;
        Ok(false)
    }

    pub fn last<R: PageReader + ?Sized>(&mut self, r: &R, info: &TreeInfo) -> Result<bool> {
        self.stack.clear();
        if info.root != 0 && self.descend_edge(r, info.root, true, info.depth)? {
            self.pos = Position::Valid;
            return Ok(true);
        }
        self.pos = Position::BeforeFirst;
        Ok(false)
    }

    /// Position at the first entry whose key is not less than `key`
    pub fn seek<R: PageReader + ?Sized>(&mut self, r: &R, info: &TreeInfo, cmp: Comparator, key: &[u8]) -> Result<bool> {
        self.stack.clear();
        self.pos = Position::Eof;
        if info.root == 0 {
            return Ok(false);
        }
        let mut pgno = info.root;
        loop {
            if self.stack.len() >= info.depth as usize {
                return Err(Error::Corrupted("tree deeper than its recorded depth"));
            }
            let view = r.page(pgno)?;
            view.expect_tree_page()?;
            if view.is_leaf()? {
                let idx = leaf_search(&view, key, cmp)?.unwrap_or_else(|at| at);
                let count = view.count()?;
                self.stack.push((pgno, idx));
                if idx < count {
                    self.pos = Position::Valid;
                    return Ok(true);
                }
                return self.forward(r, info.depth);
            }
            let idx = branch_index(&view, key, cmp)?;
            self.stack.push((pgno, idx));
            pgno = view.child(idx)?;
        }
    }

    /// Position exactly at `key`; leaves the cursor unset when it is absent
    pub fn set<R: PageReader + ?Sized>(&mut self, r: &R, info: &TreeInfo, cmp: Comparator, key: &[u8]) -> Result<bool> {
        if self.seek(r, info, cmp, key)? && self.key(r)?.as_deref().map(|k| cmp(k, key).is_eq()) == Some(true) {
            return Ok(true);
        }
        self.stack.clear();
        self.pos = Position::Unset;
        Ok(false)
    }

    pub fn next<R: PageReader + ?Sized>(&mut self, r: &R, info: &TreeInfo) -> Result<bool> {
        match self.pos {
            Position::Unset | Position::BeforeFirst => self.first(r, info),
            Position::Eof => Ok(false),
            Position::Valid => self.forward(r, info.depth),
        }
    }

    pub fn prev<R: PageReader + ?Sized>(&mut self, r: &R, info: &TreeInfo) -> Result<bool> {
        match self.pos {
            Position::Unset | Position::Eof => self.last(r, info),
            Position::BeforeFirst => Ok(false),
            Position::Valid => self.backward(r, info.depth),
        }
    }

    fn forward<R: PageReader + ?Sized>(&mut self, r: &R, depth: u32) -> Result<bool> {
        loop {
            let (pgno, idx) = *self.stack.last().ok_or(Error::Corrupted("cursor lost its page"))?;
            if idx + 1 < r.page(pgno)?.count()? {
                self.set_top(idx + 1);
                self.pos = Position::Valid;
                return Ok(true);
            }
            self.stack.pop();
            let child = loop {
                let Some(&(bp, bi)) = self.stack.last() else {
                    self.pos = Position::Eof;
                    return Ok(false);
                };
                let view = r.page(bp)?;
                if bi + 1 < view.count()? {
                    self.set_top(bi + 1);
                    break view.child(bi + 1)?;
                }
                self.stack.pop();
            };
            if self.descend_edge(r, child, false, depth)? {
                self.pos = Position::Valid;
                return Ok(true);
            }
        }
    }

    fn backward<R: PageReader + ?Sized>(&mut self, r: &R, depth: u32) -> Result<bool> {
        loop {
            let (_, idx) = *self.stack.last().ok_or(Error::Corrupted("cursor lost its page"))?;
            if idx > 0 {
                self.set_top(idx - 1);
                self.pos = Position::Valid;
                return Ok(true);
            }
            self.stack.pop();
            let child = loop {
                let Some(&(bp, bi)) = self.stack.last() else {
                    self.pos = Position::BeforeFirst;
                    return Ok(false);
                };
                if bi > 0 {
                    self.set_top(bi - 1);
                    break r.page(bp)?.child(bi - 1)?;
                }
                self.stack.pop();
            };
            if self.descend_edge(r, child, true, depth)? {
                self.pos = Position::Valid;
                return Ok(true);
            }
        }
    }

    fn set_top(&mut self, idx: usize) {
        if let Some(top) = self.stack.last_mut() {
            top.1 = idx;
        }
    }

    pub fn key<R: PageReader + ?Sized>(&self, r: &R) -> Result<Option<Vec<u8>>> {
        match (self.pos, self.stack.last()) {
            (Position::Valid, Some(&(pgno, idx))) => Ok(Some(r.page(pgno)?.key(idx)?.to_vec())),
            _ => Ok(None),
        }
    }

    pub fn current<R: PageReader + ?Sized>(&self, r: &R) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match (self.pos, self.stack.last()) {
            (Position::Valid, Some(&(pgno, idx))) => {
                let view = r.page(pgno)?;
                let (key, value) = view.leaf(idx)?;
                Ok(Some((key.to_vec(), read_value(r, value)?)))
            }
            _ => Ok(None),
        }
    }
}

/// Ordered cursor over one table as seen by a transaction.
///
/// The cursor borrows the transaction, so the snapshot it walks cannot change
/// underneath it. Every positioning call returns the entry it lands on, or
/// `None` when it runs off either end.
#[derive(Debug)]
pub struct Cursor<'txn> {
    pages: TxnPages<'txn>,
    info: TreeInfo,
    cmp: Comparator,
    raw: RawCursor,
}

impl<'txn> Cursor<'txn> {
    pub(crate) fn new(pages: TxnPages<'txn>, info: TreeInfo, cmp: Comparator) -> Self {
        Self { pages, info, cmp, raw: RawCursor::new() }
    }

    fn entry(&self, found: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if found {
            self.raw.current(&self.pages)
        } else {
            Ok(None)
        }
    }

    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = self.raw.first(&self.pages, &self.info)?;
        self.entry(found)
    }

    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = self.raw.last(&self.pages, &self.info)?;
        self.entry(found)
    }

    /// Move to the next entry; an unpositioned cursor moves to the first
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = self.raw.next(&self.pages, &self.info)?;
        self.entry(found)
    }

    /// Move to the previous entry; an unpositioned cursor moves to the last
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = self.raw.prev(&self.pages, &self.info)?;
        self.entry(found)
    }

    /// Position at the first key greater than or equal to `key`
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = self.raw.seek(&self.pages, &self.info, self.cmp, key)?;
        self.entry(found)
    }

    /// Position at exactly `key`
    pub fn set(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let found = self.raw.set(&self.pages, &self.info, self.cmp, key)?;
        Ok(self.entry(found)?.map(|(_, value)| value))
    }

    pub fn current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.raw.current(&self.pages)
    }

    /// Iterate every entry from the first
    pub fn iter(self) -> Iter<'txn> {
        Iter { cursor: self, start: Some(Start::First), done: false }
    }

    /// Iterate from the first key greater than or equal to `key`
    pub fn iter_from(self, key: &[u8]) -> Iter<'txn> {
        Iter { cursor: self, start: Some(Start::From(key.to_vec())), done: false }
    }
}

#[derive(Debug)]
enum Start {
    First,
    From(Vec<u8>),
}

/// Iterator over the entries of a cursor
#[derive(Debug)]
pub struct Iter<'txn> {
    cursor: Cursor<'txn>,
    start: Option<Start>,
    done: bool,
}

impl Iterator for Iter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match self.start.take() {
            Some(Start::First) => self.cursor.first(),
            Some(Start::From(key)) => self.cursor.seek(&key),
            None => self.cursor.next(),
        };
        match step {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{self, mem::MemPages};
    use crate::constants::WriteFlags;
    use crate::types::compare_bytes;

    fn tree(n: u32) -> (MemPages, TreeInfo) {
        let mut pages = MemPages::new(100_000);
        let mut info = TreeInfo::default();
        for i in 0..n {
            let key = format!("{:06}", i * 2);
            btree::put(&mut pages, &mut info, compare_bytes, key.as_bytes(), b"v", WriteFlags::empty()).unwrap();
        }
        (pages, info)
    }

    fn key_at(c: &RawCursor, pages: &MemPages) -> String {
        String::from_utf8(c.key(pages).unwrap().unwrap()).unwrap()
    }

    #[test]
    fn walks_forward_and_backward_across_leaves() {
        let (pages, info) = tree(2000);
        let mut c = RawCursor::new();
        let mut seen = 0;
        let mut ok = c.first(&pages, &info).unwrap();
        while ok {
            assert_eq!(key_at(&c, &pages), format!("{:06}", seen * 2));
            seen += 1;
            ok = c.next(&pages, &info).unwrap();
        }
        assert_eq!(seen, 2000);
        // past the end, prev comes back to the last entry
        assert!(c.prev(&pages, &info).unwrap());
        assert_eq!(key_at(&c, &pages), "003998");

        let mut back = 0;
        while c.prev(&pages, &info).unwrap() {
            back += 1;
        }
        assert_eq!(back, 1999);
        assert!(c.next(&pages, &info).unwrap());
        assert_eq!(key_at(&c, &pages), "000000");
    }

    #[test]
    fn seek_lands_on_next_greater_key() {
        let (pages, info) = tree(2000);
        let mut c = RawCursor::new();
        assert!(c.seek(&pages, &info, compare_bytes, b"001001").unwrap());
        assert_eq!(key_at(&c, &pages), "001002");
        assert!(c.seek(&pages, &info, compare_bytes, b"").unwrap());
        assert_eq!(key_at(&c, &pages), "000000");
        assert!(!c.seek(&pages, &info, compare_bytes, b"999999").unwrap());
        assert!(c.set(&pages, &info, compare_bytes, b"000010").unwrap());
        assert!(!c.set(&pages, &info, compare_bytes, b"000011").unwrap());
        // an unset cursor starts over from the first entry
        assert!(c.next(&pages, &info).unwrap());
        assert_eq!(key_at(&c, &pages), "000000");
    }

    #[test]
    fn empty_tree_has_no_entries() {
        let pages = MemPages::new(10);
        let info = TreeInfo::default();
        let mut c = RawCursor::new();
        assert!(!c.first(&pages, &info).unwrap());
        assert!(!c.last(&pages, &info).unwrap());
        assert!(!c.next(&pages, &info).unwrap());
        assert_eq!(c.current(&pages).unwrap(), None);
    }
}
