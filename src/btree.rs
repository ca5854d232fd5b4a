//! Copy-on-write B+Tree over pages.
//!
//! Every mutation descends from the root recording the `(page, child index)`
//! path, edits the leaf as an owned [`Node`] and then writes the path back
//! bottom-up. A page already dirty in the running write transaction is
//! rewritten in place; a committed page is copied to a freshly allocated page
//! and released, so readers of older snapshots keep seeing the old tree.

use std::cmp::Ordering;

use log::trace;

use crate::constants::{WriteFlags, FILL_THRESHOLD};
use crate::error::{Error, Result};
use crate::meta::TreeInfo;
use crate::overflow;
use crate::page::{
    fits_inline, overflow_pages_for, BranchEntry, LeafEntry, LeafRef, LeafValue, Node, PageView, PAGE_HEADER_SIZE,
};
use crate::types::{Comparator, PageNo};

/// Source of pages for tree reads
pub(crate) trait PageReader {
    fn page(&self, pgno: PageNo) -> Result<PageView<'_>>;
    fn page_size(&self) -> usize;
}

/// Page source of a write transaction
pub(crate) trait PageWriter: PageReader {
    /// Whether the page was allocated by the running transaction
    fn is_dirty(&self, pgno: PageNo) -> bool;
    fn alloc(&mut self) -> Result<PageNo>;
    fn write(&mut self, pgno: PageNo, data: Box<[u8]>);
    fn free(&mut self, pgno: PageNo);
    /// Pages that can still be allocated
    fn available(&self) -> u64;
}

/// Branch pages visited on the way to a leaf, with the child index taken
type Path = Vec<(PageNo, usize)>;

/// Pages replacing one child pointer after a level was written: the first
/// entry takes the old slot, the others are inserted after it.
type Pieces = Vec<(Vec<u8>, PageNo)>;

/// Index of the child of a branch page that covers `key`
pub(crate) fn branch_index(view: &PageView<'_>, key: &[u8], cmp: Comparator) -> Result<usize> {
    let count = view.count()?;
    if count == 0 {
        return Err(Error::Corrupted("empty branch page"));
    }
    // first separator greater than the key; entry 0 has no separator
    let (mut lo, mut hi) = (1, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if cmp(view.key(mid)?, key) == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo - 1)
}

/// Binary search within a leaf: `Ok(index)` when present, `Err(insert position)` otherwise
pub(crate) fn leaf_search(
    view: &PageView<'_>,
    key: &[u8],
    cmp: Comparator,
) -> Result<std::result::Result<usize, usize>> {
    let (mut lo, mut hi) = (0, view.count()?);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(view.key(mid)?, key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

fn descend<R: PageReader + ?Sized>(r: &R, info: &TreeInfo, key: &[u8], cmp: Comparator) -> Result<(Path, PageNo)> {
    let mut path = Vec::with_capacity(info.depth as usize);
    let mut pgno = info.root;
    for _ in 0..info.depth {
        let view = r.page(pgno)?;
        view.expect_tree_page()?;
        if view.is_leaf()? {
            if path.len() + 1 != info.depth as usize {
                return Err(Error::Corrupted("leaf found above the recorded depth"));
            }
            return Ok((path, pgno));
        }
        let idx = branch_index(&view, key, cmp)?;
        path.push((pgno, idx));
        pgno = view.child(idx)?;
    }
    Err(Error::Corrupted("tree deeper than its recorded depth"))
}

fn leaf_entries(node: Node) -> Result<Vec<LeafEntry>> {
    match node {
        Node::Leaf(entries) => Ok(entries),
        Node::Branch(_) => Err(Error::Corrupted("expected a leaf page")),
    }
}

fn branch_entries(node: Node) -> Result<Vec<BranchEntry>> {
    match node {
        Node::Branch(entries) => Ok(entries),
        Node::Leaf(_) => Err(Error::Corrupted("expected a branch page")),
    }
}

/// Load a leaf value, following its overflow chain if it has one
pub(crate) fn read_value<R: PageReader + ?Sized>(r: &R, value: LeafRef<'_>) -> Result<Vec<u8>> {
    match value {
        LeafRef::Inline(v) => Ok(v.to_vec()),
        LeafRef::Overflow { pgno, len } => overflow::read_chain(r, pgno, len as usize),
    }
}

pub(crate) fn get<R: PageReader + ?Sized>(r: &R, info: &TreeInfo, cmp: Comparator, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if info.root == 0 {
        return Ok(None);
    }
    let (_, leaf) = descend(r, info, key, cmp)?;
    let view = r.page(leaf)?;
    match leaf_search(&view, key, cmp)? {
        Ok(i) => {
            let (_, value) = view.leaf(i)?;
            read_value(r, value).map(Some)
        }
        Err(_) => Ok(None),
    }
}

fn touch<W: PageWriter + ?Sized>(w: &mut W, old: Option<PageNo>) -> Result<PageNo> {
    match old {
        Some(pgno) if w.is_dirty(pgno) => Ok(pgno),
        Some(pgno) => {
            let fresh = w.alloc()?;
            w.free(pgno);
            trace!("copied page {} to {}", pgno, fresh);
            Ok(fresh)
        }
        None => w.alloc(),
    }
}

fn store_value<W: PageWriter + ?Sized>(w: &mut W, info: &mut TreeInfo, value: &[u8], inline: bool) -> Result<LeafValue> {
    if inline {
        return Ok(LeafValue::Inline(value.to_vec()));
    }
    let pgno = overflow::write_chain(w, value)?;
    info.overflow_pages += overflow_pages_for(value.len(), w.page_size()) as u64;
    Ok(LeafValue::Overflow { pgno, len: value.len() as u32 })
}

fn release_value<W: PageWriter + ?Sized>(w: &mut W, info: &mut TreeInfo, value: LeafValue) -> Result<()> {
    if let LeafValue::Overflow { pgno, len } = value {
        let freed = overflow::free_chain(w, pgno, len as usize)?;
        info.overflow_pages = info.overflow_pages.saturating_sub(freed as u64);
    }
    Ok(())
}

/// Where to split a node that no longer fits. Sequential appends split off
/// only the last entry so that ascending loads fill their pages.
fn split_point(node: &Node, page_size: usize, append: bool) -> Result<usize> {
    let sizes = node.entry_sizes();
    let n = sizes.len();
    if n < 2 {
        return Err(Error::Corrupted("page with a single node overflows"));
    }
    let cap = page_size - PAGE_HEADER_SIZE;
    let total: usize = sizes.iter().sum();
    // a branch's right half loses its first key to the parent
    let dropped = |at: usize| match node {
        Node::Branch(entries) => entries[at].key.len(),
        Node::Leaf(_) => 0,
    };

    if append {
        let right = sizes[n - 1] - dropped(n - 1);
        if total - sizes[n - 1] <= cap && right <= cap {
            return Ok(n - 1);
        }
    }

    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for at in 1..n {
        left += sizes[at - 1];
        if left > cap {
            break;
        }
        let right = total - left - dropped(at);
        if right > cap {
            continue;
        }
        let skew = left.abs_diff(right);
        if best.map_or(true, |(_, s)| skew < s) {
            best = Some((at, skew));
        }
    }
    best.map(|(at, _)| at).ok_or(Error::Corrupted("no valid split point"))
}

/// Write one level back, splitting it in two when it overflows its page
fn store_node<W: PageWriter + ?Sized>(
    w: &mut W,
    info: &mut TreeInfo,
    node: Node,
    old: Option<PageNo>,
    append: bool,
) -> Result<Pieces> {
    let ps = w.page_size();
    if node.fits(ps) {
        let pgno = touch(w, old)?;
        w.write(pgno, node.encode(pgno, ps));
        return Ok(vec![(Vec::new(), pgno)]);
    }
    let leaf = node.is_leaf();
    let at = split_point(&node, ps, append)?;
    let (left, sep, right) = node.split_at(at);
    let lp = touch(w, old)?;
    w.write(lp, left.encode(lp, ps));
    let rp = w.alloc()?;
    w.write(rp, right.encode(rp, ps));
    if leaf {
        info.leaf_pages += 1;
    } else {
        info.branch_pages += 1;
    }
    trace!("split page at node {} into {} and {}", at, lp, rp);
    Ok(vec![(Vec::new(), lp), (sep, rp)])
}

/// Swap the child at `idx` for the pieces a written level produced; returns
/// the index after the last inserted entry.
fn splice_pieces(entries: &mut Vec<BranchEntry>, idx: usize, pieces: Pieces) -> Result<usize> {
    let mut pieces_iter = pieces.into_iter();
    if let Some((_, child)) = pieces_iter.next() {
        entries
            .get_mut(idx)
            .ok_or(Error::Corrupted("child index beyond branch"))?
            .child = child;
    }
    let mut at = idx + 1;
    for (key, child) in pieces_iter {
        entries.insert(at, BranchEntry { key, child });
        at += 1;
    }
    Ok(at)
}

/// Install the top level, adding root branches while it is still split
fn set_root<W: PageWriter + ?Sized>(w: &mut W, info: &mut TreeInfo, mut pieces: Pieces) -> Result<()> {
    while pieces.len() > 1 {
        let root = Node::Branch(pieces.into_iter().map(|(key, child)| BranchEntry { key, child }).collect());
        info.depth += 1;
        info.branch_pages += 1;
        pieces = store_node(w, info, root, None, false)?;
    }
    match pieces.first() {
        Some(&(_, root)) => {
            info.root = root;
            Ok(())
        }
        None => Err(Error::Corrupted("tree rewrite produced no root")),
    }
}

fn rewrite_path<W: PageWriter + ?Sized>(
    w: &mut W,
    info: &mut TreeInfo,
    mut path: Path,
    pgno: PageNo,
    node: Node,
    append: bool,
) -> Result<()> {
    let mut pieces = store_node(w, info, node, Some(pgno), append)?;
    while let Some((parent_pgno, idx)) = path.pop() {
        let mut entries = branch_entries(w.page(parent_pgno)?.decode()?)?;
        let split = pieces.len() > 1;
        let at = splice_pieces(&mut entries, idx, pieces)?;
        let append = split && at == entries.len();
        pieces = store_node(w, info, Node::Branch(entries), Some(parent_pgno), append)?;
    }
    set_root(w, info, pieces)
}

/// Insert or overwrite `key`. Fails with `KeyExist` under `NO_OVERWRITE`.
pub(crate) fn put<W: PageWriter + ?Sized>(
    w: &mut W,
    info: &mut TreeInfo,
    cmp: Comparator,
    key: &[u8],
    value: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    let ps = w.page_size();
    let inline = fits_inline(key.len(), value.len(), ps);
    let big_pages = if inline { 0 } else { overflow_pages_for(value.len(), ps) as u64 };
    if w.available() < 2 * (info.depth as u64 + 1) + big_pages + 1 {
        return Err(Error::MapExhausted);
    }

    if info.root == 0 {
        let value = store_value(w, info, value, inline)?;
        let node = Node::Leaf(vec![LeafEntry { key: key.to_vec(), value }]);
        let pgno = w.alloc()?;
        w.write(pgno, node.encode(pgno, ps));
        info.root = pgno;
        info.depth = 1;
        info.leaf_pages += 1;
        info.entries += 1;
        return Ok(());
    }

    let (path, leaf_pgno) = descend(&*w, info, key, cmp)?;
    let (found, mut entries) = {
        let view = w.page(leaf_pgno)?;
        (leaf_search(&view, key, cmp)?, leaf_entries(view.decode()?)?)
    };
    if found.is_ok() && flags.contains(WriteFlags::NO_OVERWRITE) {
        return Err(Error::KeyExist);
    }

    let value = store_value(w, info, value, inline)?;
    let append = match found {
        Ok(i) => {
            let old = std::mem::replace(&mut entries[i].value, value);
            release_value(w, info, old)?;
            false
        }
        Err(i) => {
            entries.insert(i, LeafEntry { key: key.to_vec(), value });
            info.entries += 1;
            i + 1 == entries.len()
        }
    };
    rewrite_path(w, info, path, leaf_pgno, Node::Leaf(entries), append)
}

fn underfull(node: &Node, page_size: usize) -> bool {
    node.fill(page_size) < FILL_THRESHOLD || (!node.is_leaf() && node.len() < 2)
}

fn rebalance_path<W: PageWriter + ?Sized>(
    w: &mut W,
    info: &mut TreeInfo,
    mut path: Path,
    mut pgno: PageNo,
    mut node: Node,
) -> Result<()> {
    let ps = w.page_size();
    while let Some((parent_pgno, idx)) = path.pop() {
        let mut parent = branch_entries(w.page(parent_pgno)?.decode()?)?;
        if idx >= parent.len() {
            return Err(Error::Corrupted("child index beyond branch"));
        }
        if underfull(&node, ps) && parent.len() > 1 {
            let (li, ri) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };
            let sibling_pgno = parent[if idx > 0 { li } else { ri }].child;
            let sibling = w.page(sibling_pgno)?.decode()?;
            let (left, left_pgno, right, right_pgno) = if idx > 0 {
                (sibling, sibling_pgno, node, pgno)
            } else {
                (node, pgno, sibling, sibling_pgno)
            };
            let sep = std::mem::take(&mut parent[ri].key);
            let combined = Node::concat(left, sep, right)?;
            let leaf = combined.is_leaf();
            if combined.fits(ps) {
                let merged = touch(w, Some(left_pgno))?;
                w.write(merged, combined.encode(merged, ps));
                w.free(right_pgno);
                if leaf {
                    info.leaf_pages = info.leaf_pages.saturating_sub(1);
                } else {
                    info.branch_pages = info.branch_pages.saturating_sub(1);
                }
                parent[li].child = merged;
                parent.remove(ri);
                trace!("merged page {} into {}", right_pgno, merged);
            } else {
                let at = split_point(&combined, ps, false)?;
                let (l, sep, r) = combined.split_at(at);
                let lp = touch(w, Some(left_pgno))?;
                w.write(lp, l.encode(lp, ps));
                let rp = touch(w, Some(right_pgno))?;
                w.write(rp, r.encode(rp, ps));
                parent[li].child = lp;
                parent[ri] = BranchEntry { key: sep, child: rp };
            }
        } else {
            // a separator taken from a redistribution can leave a branch too big for its page
            let pieces = store_node(w, info, node, Some(pgno), false)?;
            splice_pieces(&mut parent, idx, pieces)?;
        }
        node = Node::Branch(parent);
        pgno = parent_pgno;
    }

    match node {
        Node::Branch(entries) if entries.len() == 1 => {
            w.free(pgno);
            info.branch_pages = info.branch_pages.saturating_sub(1);
            info.depth -= 1;
            let mut root = entries[0].child;
            loop {
                let only_child = {
                    let view = w.page(root)?;
                    if view.is_leaf()? || view.count()? != 1 {
                        None
                    } else {
                        Some(view.child(0)?)
                    }
                };
                match only_child {
                    Some(child) => {
                        w.free(root);
                        info.branch_pages = info.branch_pages.saturating_sub(1);
                        info.depth -= 1;
                        root = child;
                    }
                    None => break,
                }
            }
            info.root = root;
        }
        Node::Branch(entries) if entries.is_empty() => {
            return Err(Error::Corrupted("root branch lost all children"));
        }
        node => {
            let pieces = store_node(w, info, node, Some(pgno), false)?;
            set_root(w, info, pieces)?;
        }
    }
    Ok(())
}

/// Remove `key`; returns whether it was present
pub(crate) fn delete<W: PageWriter + ?Sized>(w: &mut W, info: &mut TreeInfo, cmp: Comparator, key: &[u8]) -> Result<bool> {
    if info.root == 0 {
        return Ok(false);
    }
    let (path, leaf_pgno) = descend(&*w, info, key, cmp)?;
    let (idx, mut entries) = {
        let view = w.page(leaf_pgno)?;
        match leaf_search(&view, key, cmp)? {
            Ok(i) => (i, leaf_entries(view.decode()?)?),
            Err(_) => return Ok(false),
        }
    };
    // two pages per level for a copy plus a split or a sibling, and one for a new root
    if w.available() < 2 * (info.depth as u64 + 1) + 1 {
        return Err(Error::MapExhausted);
    }
    let removed = entries.remove(idx);
    release_value(w, info, removed.value)?;
    info.entries = info.entries.saturating_sub(1);
    rebalance_path(w, info, path, leaf_pgno, Node::Leaf(entries))?;
    Ok(true)
}

/// Release every page of a tree, leaving it without pages
pub(crate) fn free_tree<W: PageWriter + ?Sized>(w: &mut W, info: &mut TreeInfo) -> Result<()> {
    let limit = info.branch_pages + info.leaf_pages;
    let mut visited = 0u64;
    let mut stack = if info.root == 0 { Vec::new() } else { vec![info.root] };
    while let Some(pgno) = stack.pop() {
        visited += 1;
        if visited > limit {
            return Err(Error::Corrupted("tree has more pages than recorded"));
        }
        let node = {
            let view = w.page(pgno)?;
            view.expect_tree_page()?;
            view.decode()?
        };
        match node {
            Node::Leaf(entries) => {
                for entry in entries {
                    release_value(w, info, entry.value)?;
                }
            }
            Node::Branch(entries) => stack.extend(entries.iter().map(|e| e.child)),
        }
        w.free(pgno);
    }
    *info = TreeInfo { flags: info.flags, ..TreeInfo::default() };
    Ok(())
}

/// In-memory page source for exercising tree code without a file
#[cfg(test)]
pub(crate) mod mem {
    use std::collections::{HashMap, HashSet};

    use super::*;

    #[derive(Debug, Default)]
    pub struct MemPages {
        pub pages: HashMap<PageNo, Box<[u8]>>,
        pub clean: HashSet<PageNo>,
        pub freed: Vec<PageNo>,
        pub next: PageNo,
        pub limit: PageNo,
    }

    impl MemPages {
        pub fn new(limit: PageNo) -> Self {
            Self { next: 2, limit, ..Self::default() }
        }

        /// Treat every page written so far as committed
        pub fn commit(&mut self) {
            self.clean.extend(self.pages.keys().copied());
            self.freed.clear();
        }
    }

    impl PageReader for MemPages {
        fn page(&self, pgno: PageNo) -> Result<PageView<'_>> {
            let buf = self.pages.get(&pgno).ok_or(Error::Corrupted("missing page"))?;
            PageView::new(buf)
        }

        fn page_size(&self) -> usize {
            crate::constants::PAGE_SIZE
        }
    }

    impl PageWriter for MemPages {
        fn is_dirty(&self, pgno: PageNo) -> bool {
            !self.clean.contains(&pgno)
        }

        fn alloc(&mut self) -> Result<PageNo> {
            if self.next >= self.limit {
                return Err(Error::MapExhausted);
            }
            self.next += 1;
            Ok(self.next - 1)
        }

        fn write(&mut self, pgno: PageNo, data: Box<[u8]>) {
            self.pages.insert(pgno, data);
        }

        fn free(&mut self, pgno: PageNo) {
            self.freed.push(pgno);
        }

        fn available(&self) -> u64 {
            self.limit - self.next
        }
    }
}
