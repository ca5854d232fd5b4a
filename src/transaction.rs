use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use memmap2::Mmap;

use crate::btree::{self, PageReader, PageWriter};
use crate::catalog;
use crate::constants::{EnvFlags, TableFlags, WriteFlags};
use crate::cursor::Cursor;
use crate::env::{Environment, WriterGuard};
use crate::error::{Error, Result};
use crate::freelist::{self, PageAllocator};
use crate::meta::{Meta, TreeInfo};
use crate::page::PageView;
use crate::reader::ReaderSlot;
use crate::store::committed_page;
use crate::table::Table;
use crate::types::{Comparator, PageNo, Stat, TxnId};

type DirtyPages = HashMap<PageNo, Box<[u8]>>;

/// Committed state a transaction reads from: a meta page and a mapping that
/// covers every page it references
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub meta: Meta,
    pub map: Arc<Mmap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
    /// An operation failed halfway; only abort is left
    Failed,
}

/// A table as seen by this transaction
#[derive(Debug)]
struct TableState {
    /// Catalog key
    key: Vec<u8>,
    info: TreeInfo,
    /// Descriptor changed and must be written to the catalog on commit
    dirty: bool,
}

#[derive(Debug)]
struct WriteState<'env> {
    _writer: WriterGuard<'env>,
    dirty: DirtyPages,
    alloc: PageAllocator,
    catalog: TreeInfo,
    freelist: TreeInfo,
    /// Handles registered by this transaction, closed again on abort
    created: Vec<Table>,
}

#[derive(Debug)]
enum Mode<'env> {
    Read(ReaderSlot<'env>),
    Write(Box<WriteState<'env>>),
    Closed,
}

/// Read view of a transaction: its dirty pages first, then the snapshot
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxnPages<'a> {
    map: &'a Mmap,
    last_pgno: PageNo,
    page_size: usize,
    dirty: Option<&'a DirtyPages>,
}

impl PageReader for TxnPages<'_> {
    fn page(&self, pgno: PageNo) -> Result<PageView<'_>> {
        match self.dirty.and_then(|d| d.get(&pgno)) {
            Some(buf) => PageView::new(buf),
            None => committed_page(self.map, pgno, self.page_size, self.last_pgno),
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Page source handed to tree mutations of a write transaction
#[derive(Debug)]
pub(crate) struct WritePages<'a> {
    map: &'a Mmap,
    last_pgno: PageNo,
    page_size: usize,
    pub dirty: &'a mut DirtyPages,
    pub alloc: &'a mut PageAllocator,
}

impl<'a> WritePages<'a> {
    fn new(snapshot: &'a Snapshot, page_size: usize, dirty: &'a mut DirtyPages, alloc: &'a mut PageAllocator) -> Self {
        Self { map: &snapshot.map, last_pgno: snapshot.meta.last_pgno, page_size, dirty, alloc }
    }
}

impl PageReader for WritePages<'_> {
    fn page(&self, pgno: PageNo) -> Result<PageView<'_>> {
        match self.dirty.get(&pgno) {
            Some(buf) => PageView::new(buf),
            None => committed_page(self.map, pgno, self.page_size, self.last_pgno),
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

impl PageWriter for WritePages<'_> {
    fn is_dirty(&self, pgno: PageNo) -> bool {
        self.dirty.contains_key(&pgno)
    }

    fn alloc(&mut self) -> Result<PageNo> {
        self.alloc.alloc()
    }

    fn write(&mut self, pgno: PageNo, data: Box<[u8]>) {
        self.dirty.insert(pgno, data);
    }

    fn free(&mut self, pgno: PageNo) {
        let dirty = self.dirty.remove(&pgno).is_some();
        self.alloc.release(pgno, dirty);
    }

    fn available(&self) -> u64 {
        self.alloc.available()
    }
}

/// Errors after which the dirty state of a transaction can no longer be trusted
fn poisons(err: &Error) -> bool {
    matches!(err, Error::Io(_) | Error::Corrupted(_) | Error::VersionMismatch { .. })
}

fn commit_failed(err: Error) -> Error {
    Error::CommitFailed(Box::new(err))
}

/// Database transaction
///
/// A read transaction pins the snapshot it began on until it ends. A write
/// transaction holds the environment's single writer slot; its pages stay
/// private until `commit` publishes them. Dropping an active transaction
/// aborts it.
#[derive(Debug)]
pub struct Transaction<'env> {
    /// Reference to environment
    env: &'env Environment,
    /// Snapshot id for readers, id of the commit being built for writers
    txn_id: TxnId,
    snapshot: Snapshot,
    state: Cell<TxnState>,
    /// Tables touched by this transaction
    tables: RefCell<HashMap<Table, TableState>>,
    mode: Mode<'env>,
}

impl<'env> Transaction<'env> {
    pub(crate) fn begin_read(env: &'env Environment) -> Result<Self> {
        let (slot, snapshot) = env.readers().register_with(|| {
            let snapshot = env.snapshot();
            (snapshot.meta.txn_id, snapshot)
        })?;
        Ok(Self {
            env,
            txn_id: snapshot.meta.txn_id,
            snapshot,
            state: Cell::new(TxnState::Active),
            tables: RefCell::new(HashMap::new()),
            mode: Mode::Read(slot),
        })
    }

    pub(crate) fn begin_write(env: &'env Environment) -> Result<Self> {
        if env.flags().contains(EnvFlags::READ_ONLY) {
            return Err(Error::EnvReadOnly);
        }
        let writer = env.writer().acquire(env.flags().contains(EnvFlags::WRITER_WAIT))?;
        if env.is_poisoned() {
            return Err(Error::Panic);
        }
        let snapshot = env.snapshot();
        let txn_id = snapshot.meta.txn_id + 1;
        let mut ws = WriteState {
            _writer: writer,
            dirty: HashMap::new(),
            alloc: PageAllocator::new(snapshot.meta.last_pgno, env.max_pgno()),
            catalog: snapshot.meta.catalog,
            freelist: snapshot.meta.freelist,
            created: Vec::new(),
        };

        let oldest = env.readers().min_active_snapshot();
        let mut freelist = ws.freelist;
        let mut pages = WritePages::new(&snapshot, env.page_size(), &mut ws.dirty, &mut ws.alloc);
        let reclaimed = freelist::reclaim(&mut pages, &mut freelist, oldest)?;
        ws.freelist = freelist;
        debug!(
            "began write txn {} (reclaimed {} pages, oldest reader {:?})",
            txn_id, reclaimed, oldest
        );

        Ok(Self {
            env,
            txn_id,
            snapshot,
            state: Cell::new(TxnState::Active),
            tables: RefCell::new(HashMap::new()),
            mode: Mode::Write(Box::new(ws)),
        })
    }

    /// Transaction id: the snapshot of a reader, the commit a writer builds
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    pub fn is_read_only(&self) -> bool {
        !matches!(self.mode, Mode::Write(_))
    }

    pub(crate) fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    fn check_active(&self) -> Result<()> {
        match self.state.get() {
            TxnState::Active => Ok(()),
            TxnState::Failed => Err(Error::BadTxn),
            TxnState::Committed | TxnState::Aborted => Err(Error::TransactionClosed),
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_active()?;
        match self.mode {
            Mode::Write(_) => Ok(()),
            _ => Err(Error::ReadOnly),
        }
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if poisons(e) {
                warn!("txn {} failed and must be aborted: {}", self.txn_id, e);
                self.state.set(TxnState::Failed);
            }
        }
        result
    }

    fn pages(&self) -> TxnPages<'_> {
        TxnPages {
            map: &self.snapshot.map,
            last_pgno: self.snapshot.meta.last_pgno,
            page_size: self.env.page_size(),
            dirty: match &self.mode {
                Mode::Write(ws) => Some(&ws.dirty),
                _ => None,
            },
        }
    }

    fn catalog_info(&self) -> TreeInfo {
        match &self.mode {
            Mode::Write(ws) => ws.catalog,
            _ => self.snapshot.meta.catalog,
        }
    }

    /// Run a tree mutation against the dirty pages and the catalog descriptor
    fn with_writer<T>(&mut self, f: impl FnOnce(&mut WritePages<'_>, &mut TreeInfo) -> Result<T>) -> Result<T> {
        let page_size = self.env.page_size();
        let ws = match &mut self.mode {
            Mode::Write(ws) => ws,
            Mode::Read(_) => return Err(Error::ReadOnly),
            Mode::Closed => return Err(Error::TransactionClosed),
        };
        let WriteState { dirty, alloc, catalog, .. } = &mut **ws;
        let mut pages = WritePages::new(&self.snapshot, page_size, dirty, alloc);
        let result = f(&mut pages, catalog);
        self.track(result)
    }

    /// Resolve a handle to the tree descriptor this transaction sees
    fn table_info(&self, table: &Table) -> Result<(TreeInfo, Comparator)> {
        let slot = self.env.tables().slot(table)?;
        if let Some(state) = self.tables.borrow().get(table) {
            return Ok((state.info, slot.cmp));
        }
        let key = catalog::table_key(slot.name.as_deref());
        let info = self
            .track(catalog::lookup(&self.pages(), &self.catalog_info(), &key))?
            .ok_or(Error::TableNotFound)?;
        self.tables.borrow_mut().insert(*table, TableState { key, info, dirty: false });
        Ok((info, slot.cmp))
    }

    fn update_table(&self, table: &Table, info: TreeInfo) {
        if let Some(state) = self.tables.borrow_mut().get_mut(table) {
            state.info = info;
            state.dirty = true;
        }
    }

    pub(crate) fn open_table(&mut self, name: Option<&str>, flags: TableFlags) -> Result<Table> {
        self.check_active()?;
        let name = name.filter(|n| !n.is_empty());
        let key = catalog::table_key(name);
        let persistent = flags & TableFlags::PERSISTENT;

        let existing = self.env.tables().find(name);
        let seen = existing.and_then(|t| self.tables.borrow().get(&t).map(|s| s.info));
        let stored = match seen {
            Some(info) => Some(info),
            None => self.track(catalog::lookup(&self.pages(), &self.catalog_info(), &key))?,
        };
        if let Some(info) = stored {
            if TableFlags::from_bits_truncate(info.flags) & TableFlags::PERSISTENT != persistent {
                return Err(Error::Incompatible);
            }
        } else if !flags.contains(TableFlags::CREATE) || self.is_read_only() {
            return Err(Error::TableNotFound);
        }

        let table = match existing {
            Some(table) => table,
            None => self.env.tables().register(name, persistent)?,
        };
        let info = match stored {
            Some(info) => info,
            None => {
                let created = self.with_writer(|pages, catalog| {
                    let info = catalog::create(pages, persistent)?;
                    catalog::store(pages, catalog, &key, &info)?;
                    Ok(info)
                });
                match created {
                    Ok(info) => {
                        debug!("created table {:?} in txn {}", name, self.txn_id);
                        info
                    }
                    Err(e) => {
                        if existing.is_none() {
                            self.env.tables().close(&table);
                        }
                        return Err(e);
                    }
                }
            }
        };
        if existing.is_none() {
            if let Mode::Write(ws) = &mut self.mode {
                ws.created.push(table);
            }
        }
        self.tables.borrow_mut().insert(table, TableState { key, info, dirty: false });
        Ok(table)
    }

    pub(crate) fn get(&self, table: &Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;
        self.env.check_key(key)?;
        let (info, cmp) = self.table_info(table)?;
        self.track(btree::get(&self.pages(), &info, cmp, key))
    }

    pub(crate) fn put(&mut self, table: &Table, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_writable()?;
        self.env.check_key(key)?;
        self.env.check_value(value)?;
        let (mut info, cmp) = self.table_info(table)?;
        self.with_writer(|pages, _| btree::put(pages, &mut info, cmp, key, value, flags))?;
        self.update_table(table, info);
        Ok(())
    }

    pub(crate) fn del(&mut self, table: &Table, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        self.env.check_key(key)?;
        let (mut info, cmp) = self.table_info(table)?;
        let found = self.with_writer(|pages, _| btree::delete(pages, &mut info, cmp, key))?;
        if found {
            self.update_table(table, info);
        }
        Ok(found)
    }

    pub(crate) fn cursor(&self, table: &Table) -> Result<Cursor<'_>> {
        self.check_active()?;
        let (info, cmp) = self.table_info(table)?;
        Ok(Cursor::new(self.pages(), info, cmp))
    }

    pub(crate) fn stat(&self, table: &Table) -> Result<Stat> {
        self.check_active()?;
        let (info, _) = self.table_info(table)?;
        Ok(info.stat(self.env.page_size()))
    }

    pub(crate) fn table_flags(&self, table: &Table) -> Result<TableFlags> {
        self.check_active()?;
        let (info, _) = self.table_info(table)?;
        Ok(TableFlags::from_bits_truncate(info.flags))
    }

    pub(crate) fn set_compare(&self, table: &Table, cmp: Comparator) -> Result<()> {
        self.check_active()?;
        self.env.tables().set_compare(table, cmp)
    }

    pub(crate) fn drop_table(&mut self, table: &Table, delete: bool) -> Result<()> {
        self.check_writable()?;
        let (mut info, _) = self.table_info(table)?;
        let key = self
            .tables
            .borrow()
            .get(table)
            .map(|s| s.key.clone())
            .ok_or(Error::BadTable)?;
        self.with_writer(|pages, catalog| {
            if delete {
                catalog::remove(pages, catalog, &key)?;
            }
            btree::free_tree(pages, &mut info)
        })?;
        if delete {
            self.tables.borrow_mut().remove(table);
            self.env.tables().close(table);
            debug!("deleted table {:?} in txn {}", String::from_utf8_lossy(&key), self.txn_id);
        } else {
            self.update_table(table, info);
        }
        Ok(())
    }

    /// Names of every named table visible to this transaction
    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.check_active()?;
        self.track(catalog::names(&self.pages(), &self.catalog_info()))
    }

    /// Commit the transaction
    ///
    /// For a read transaction this only releases the snapshot. A failed write
    /// commit leaves the previous snapshot authoritative and reports
    /// `CommitFailed`; the transaction is aborted either way.
    pub fn commit(&mut self) -> Result<()> {
        match self.state.get() {
            TxnState::Active => {}
            TxnState::Failed => {
                self.abort();
                return Err(Error::BadTxn);
            }
            TxnState::Committed | TxnState::Aborted => return Err(Error::TransactionClosed),
        }
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Read(slot) => {
                drop(slot);
                self.state.set(TxnState::Committed);
                Ok(())
            }
            Mode::Write(mut ws) => {
                let result = self.commit_write(&mut ws);
                match result {
                    Ok(()) => self.state.set(TxnState::Committed),
                    Err(_) => {
                        self.rollback(&ws);
                        self.state.set(TxnState::Aborted);
                    }
                }
                result
            }
            Mode::Closed => Err(Error::TransactionClosed),
        }
    }

    fn commit_write(&self, ws: &mut WriteState<'env>) -> Result<()> {
        let env = self.env;
        let page_size = env.page_size();
        let tables: Vec<(Vec<u8>, TreeInfo)> = self
            .tables
            .borrow()
            .values()
            .filter(|s| s.dirty)
            .map(|s| (s.key.clone(), s.info))
            .collect();

        let mut catalog = ws.catalog;
        let mut freelist = ws.freelist;
        let saved = {
            let mut pages = WritePages::new(&self.snapshot, page_size, &mut ws.dirty, &mut ws.alloc);
            for (key, info) in &tables {
                catalog::store(&mut pages, &mut catalog, key, info).map_err(commit_failed)?;
            }
            freelist::save(&mut pages, &mut freelist, self.txn_id).map_err(commit_failed)?
        };

        let last_pgno = ws.alloc.last_pgno();
        let grew = env.store().ensure_pages(last_pgno + 1).map_err(commit_failed)?;
        let mut dirty: Vec<(PageNo, &[u8])> = ws.dirty.iter().map(|(pgno, buf)| (*pgno, &buf[..])).collect();
        dirty.sort_unstable_by_key(|&(pgno, _)| pgno);
        env.store().write_pages(&dirty).map_err(commit_failed)?;
        if !env.flags().contains(EnvFlags::NO_SYNC) {
            env.store().sync().map_err(commit_failed)?;
        }

        let meta = Meta {
            page_size: page_size as u32,
            map_size: env.store().map_size(),
            last_pgno,
            txn_id: self.txn_id,
            catalog,
            freelist,
        };
        env.publish(meta, &self.snapshot.map)?;
        debug!(
            "committed txn {} ({} dirty pages, {} pages to freelist, file grew: {})",
            self.txn_id,
            dirty.len(),
            saved,
            grew
        );
        Ok(())
    }

    fn rollback(&self, ws: &WriteState<'env>) {
        for table in &ws.created {
            self.env.tables().close(table);
        }
    }

    /// Abort the transaction. Calling it again, or after commit, does nothing.
    pub fn abort(&mut self) {
        if matches!(self.state.get(), TxnState::Committed | TxnState::Aborted) {
            return;
        }
        if let Mode::Write(ws) = std::mem::replace(&mut self.mode, Mode::Closed) {
            self.rollback(&ws);
            debug!("aborted write txn {} ({} dirty pages discarded)", self.txn_id, ws.dirty.len());
        }
        self.state.set(TxnState::Aborted);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if matches!(self.state.get(), TxnState::Active | TxnState::Failed) {
            if let Mode::Write(_) = self.mode {
                warn!("write txn {} dropped without commit, aborting", self.txn_id);
            }
            self.abort();
        }
    }
}

