//! Table catalog: a tree mapping table names to their tree descriptors.
//!
//! The unnamed default table is stored under the empty key.

use crate::btree::{self, PageReader, PageWriter};
use crate::constants::{TableFlags, WriteFlags};
use crate::cursor::RawCursor;
use crate::error::{Error, Result};
use crate::meta::TreeInfo;
use crate::page::Node;
use crate::types::compare_bytes;

pub(crate) fn table_key(name: Option<&str>) -> Vec<u8> {
    name.map(|n| n.as_bytes().to_vec()).unwrap_or_default()
}

pub(crate) fn lookup<R: PageReader + ?Sized>(r: &R, catalog: &TreeInfo, key: &[u8]) -> Result<Option<TreeInfo>> {
    btree::get(r, catalog, compare_bytes, key)?
        .map(|value| TreeInfo::decode(&value))
        .transpose()
}

pub(crate) fn store<W: PageWriter + ?Sized>(w: &mut W, catalog: &mut TreeInfo, key: &[u8], info: &TreeInfo) -> Result<()> {
    btree::put(w, catalog, compare_bytes, key, &info.to_bytes(), WriteFlags::empty())
}

pub(crate) fn remove<W: PageWriter + ?Sized>(w: &mut W, catalog: &mut TreeInfo, key: &[u8]) -> Result<bool> {
    btree::delete(w, catalog, compare_bytes, key)
}

/// Allocate the empty root leaf of a new table
pub(crate) fn create<W: PageWriter + ?Sized>(w: &mut W, flags: TableFlags) -> Result<TreeInfo> {
    let pgno = w.alloc()?;
    let leaf = Node::Leaf(Vec::new());
    w.write(pgno, leaf.encode(pgno, w.page_size()));
    Ok(TreeInfo {
        root: pgno,
        depth: 1,
        flags: (flags & TableFlags::PERSISTENT).bits(),
        leaf_pages: 1,
        ..TreeInfo::default()
    })
}

/// Names of all named tables, in key order
pub(crate) fn names<R: PageReader + ?Sized>(r: &R, catalog: &TreeInfo) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut cursor = RawCursor::new();
    let mut more = cursor.first(r, catalog)?;
    while more {
        if let Some(key) = cursor.key(r)? {
            if !key.is_empty() {
                names.push(String::from_utf8(key).map_err(|_| Error::Corrupted("table name is not UTF-8"))?);
            }
        }
        more = cursor.next(r, catalog)?;
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mem::MemPages;
    use crate::constants::PageFlags;

    #[test]
    fn stores_and_lists_tables() {
        let mut pages = MemPages::new(100);
        let mut catalog = TreeInfo::default();
        let users = create(&mut pages, TableFlags::CREATE | TableFlags::REVERSE_KEY).unwrap();
        assert_eq!(users.flags, TableFlags::REVERSE_KEY.bits());
        assert!(pages.page(users.root).unwrap().flags().unwrap().contains(PageFlags::LEAF));

        store(&mut pages, &mut catalog, b"users", &users).unwrap();
        store(&mut pages, &mut catalog, &table_key(None), &TreeInfo::default()).unwrap();
        store(&mut pages, &mut catalog, b"orders", &TreeInfo::default()).unwrap();
        assert_eq!(lookup(&pages, &catalog, b"users").unwrap(), Some(users));
        assert_eq!(lookup(&pages, &catalog, b"nope").unwrap(), None);
        assert_eq!(names(&pages, &catalog).unwrap(), vec!["orders".to_string(), "users".to_string()]);

        assert!(remove(&mut pages, &mut catalog, b"orders").unwrap());
        assert_eq!(names(&pages, &catalog).unwrap(), vec!["users".to_string()]);
    }
}
