use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use memmap2::Mmap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::constants::{
    EnvFlags, DATA_FILE_NAME, DEFAULT_FILE_MODE, DEFAULT_MAP_SIZE, DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_READERS,
    DEFAULT_MAX_TABLES, DEFAULT_MAX_VALUE_SIZE, META_PAGES, PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::page::max_key_limit;
use crate::reader::{ReaderInfo, ReaderTable};
use crate::store::PageStore;
use crate::table::{Table, TableRegistry};
use crate::transaction::{Snapshot, Transaction};
use crate::types::{EnvInfo, PageNo, Stat};

/// Data files currently open in this process
static OPEN_PATHS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes copied per write by `copy_to`
const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Claim on a data file path, released when the environment goes away
#[derive(Debug)]
struct Registration(PathBuf);

impl Registration {
    fn claim(path: PathBuf) -> Result<Self> {
        if !OPEN_PATHS.lock().insert(path.clone()) {
            return Err(Error::EnvAlreadyOpen);
        }
        Ok(Self(path))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        OPEN_PATHS.lock().remove(&self.0);
    }
}

/// The single write slot of an environment
#[derive(Debug, Default)]
pub(crate) struct WriterLock {
    busy: Mutex<bool>,
    released: Condvar,
}

impl WriterLock {
    pub fn acquire(&self, wait: bool) -> Result<WriterGuard<'_>> {
        let mut busy = self.busy.lock();
        while *busy {
            if !wait {
                return Err(Error::WriterBusy);
            }
            self.released.wait(&mut busy);
        }
        *busy = true;
        Ok(WriterGuard { lock: self })
    }
}

/// Held by the active write transaction
#[derive(Debug)]
pub(crate) struct WriterGuard<'a> {
    lock: &'a WriterLock,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        *self.lock.busy.lock() = false;
        self.lock.released.notify_one();
    }
}

/// Options for opening an [`Environment`]
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    map_size: usize,
    max_readers: u32,
    max_tables: u32,
    max_key_size: usize,
    max_value_size: usize,
    flags: EnvFlags,
    mode: u32,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_tables: DEFAULT_MAX_TABLES,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            flags: EnvFlags::empty(),
            mode: DEFAULT_FILE_MODE,
        }
    }
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum size the data file may grow to
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    /// Maximum number of concurrent read transactions
    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    /// Maximum number of table handles open at the same time
    pub fn max_tables(mut self, tables: u32) -> Self {
        self.max_tables = tables;
        self
    }

    pub fn max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }

    pub fn max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Permission bits of a newly created data file
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.map_size < (META_PAGES + 2) * PAGE_SIZE {
            return Err(Error::InvalidConfig("map size must hold at least four pages"));
        }
        if self.max_readers == 0 {
            return Err(Error::InvalidConfig("max_readers must be positive"));
        }
        if self.max_tables == 0 {
            return Err(Error::InvalidConfig("max_tables must be positive"));
        }
        if self.max_key_size == 0 || self.max_key_size > max_key_limit(PAGE_SIZE) {
            return Err(Error::InvalidConfig("max_key_size must be between 1 and the page-derived limit"));
        }
        if self.max_value_size > u32::MAX as usize {
            return Err(Error::InvalidConfig("max_value_size must fit in 32 bits"));
        }
        Ok(())
    }

    /// Open (or create) the environment at `path`
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Environment> {
        self.validate()?;
        let path = path.as_ref();
        let read_only = self.flags.contains(EnvFlags::READ_ONLY);
        let data_path = if self.flags.contains(EnvFlags::NO_SUB_DIR) {
            path.to_path_buf()
        } else {
            if !path.is_dir() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("environment directory {} does not exist", path.display()),
                )));
            }
            path.join(DATA_FILE_NAME)
        };

        let store = PageStore::open(&data_path, self.mode, read_only, PAGE_SIZE, self.map_size)?;
        let registration = Registration::claim(fs::canonicalize(&data_path)?)?;

        if store.len() == 0 {
            if read_only {
                return Err(Error::Corrupted("data file is empty"));
            }
            let meta = Meta::initial(self.map_size);
            store.ensure_pages(META_PAGES as u64)?;
            for slot in 0..META_PAGES {
                store.write_page(slot as PageNo, &meta.encode(slot))?;
            }
            store.sync()?;
            debug!("initialized data file {}", data_path.display());
        }

        let map = store.map()?;
        let (slot, meta) = Meta::select([&map[..PAGE_SIZE], &map[PAGE_SIZE..2 * PAGE_SIZE]])?;
        if store.len() < (meta.last_pgno + 1) * PAGE_SIZE as u64 {
            return Err(Error::Corrupted("data file shorter than its last page"));
        }
        debug!(
            "opened environment {} (map size {}, meta slot {}, txn {})",
            data_path.display(),
            store.map_size(),
            slot,
            meta.txn_id
        );

        let id = NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Environment {
            id,
            path: data_path,
            flags: self.flags,
            max_key_size: self.max_key_size,
            max_value_size: self.max_value_size,
            store,
            current: RwLock::new(Snapshot { meta, map }),
            readers: ReaderTable::new(self.max_readers),
            tables: TableRegistry::new(id, self.max_tables),
            writer: WriterLock::default(),
            poisoned: AtomicBool::new(false),
            _registration: registration,
        })
    }
}

/// Database environment: one data file, one writer, many readers
#[derive(Debug)]
pub struct Environment {
    id: u64,
    /// Path of the data file
    path: PathBuf,
    /// Environment flags
    flags: EnvFlags,
    max_key_size: usize,
    max_value_size: usize,
    store: PageStore,
    /// Latest committed snapshot
    current: RwLock<Snapshot>,
    readers: ReaderTable,
    tables: TableRegistry,
    writer: WriterLock,
    /// Set when a meta update failed halfway
    poisoned: AtomicBool,
    _registration: Registration,
}

impl Environment {
    /// Open the environment directory at `path` with the given maximum size
    /// and file permissions
    pub fn open<P: AsRef<Path>>(path: P, max_size: usize, permissions: u32) -> Result<Self> {
        EnvBuilder::new().map_size(max_size).mode(permissions).open(path)
    }

    pub fn builder() -> EnvBuilder {
        EnvBuilder::new()
    }

    /// Begin a write transaction
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_write(self)
    }

    /// Begin a read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_read(self)
    }

    pub fn begin_transaction(&self, read_only: bool) -> Result<Transaction<'_>> {
        if read_only {
            self.begin_ro_txn()
        } else {
            self.begin_txn()
        }
    }

    /// Close a table handle. Operations through the handle fail with `BadTable` afterwards.
    pub fn close_table(&self, table: Table) {
        self.tables.close(&table);
    }

    /// Statistics of the table catalog
    pub fn stat(&self) -> Stat {
        self.snapshot().meta.catalog.stat(PAGE_SIZE)
    }

    pub fn info(&self) -> EnvInfo {
        let meta = self.snapshot().meta;
        EnvInfo {
            map_size: self.store.map_size() as usize,
            file_size: self.store.len(),
            last_pgno: meta.last_pgno,
            last_txn_id: meta.txn_id,
            max_readers: self.readers.max_readers() as u32,
            num_readers: self.readers.len() as u32,
        }
    }

    /// Active read transactions
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.readers.list()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Largest key accepted by `put`
    pub fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    /// Copy the latest snapshot into `dir`, which must not hold a data file yet.
    /// Writers may keep committing while the copy runs.
    pub fn copy_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let txn = self.begin_ro_txn()?;
        let snapshot = txn.snapshot();
        let meta = snapshot.meta;
        let dest = dir.as_ref().join(DATA_FILE_NAME);
        let mut file = OpenOptions::new().write(true).create_new(true).mode(DEFAULT_FILE_MODE).open(&dest)?;

        for slot in 0..META_PAGES {
            file.write_all(&meta.encode(slot))?;
        }
        let end = (meta.last_pgno as usize + 1) * PAGE_SIZE;
        let mut offset = META_PAGES * PAGE_SIZE;
        while offset < end {
            let chunk = COPY_CHUNK_SIZE.min(end - offset);
            let data = snapshot
                .map
                .get(offset..offset + chunk)
                .ok_or(Error::Corrupted("snapshot extends past its map"))?;
            file.write_all(data)?;
            offset += chunk;
        }
        file.sync_all()?;
        debug!("copied txn {} ({} pages) to {}", meta.txn_id, meta.last_pgno + 1, dest.display());
        Ok(())
    }

    /// Flush the data file to disk. Without `force` this does nothing when
    /// the environment was opened with `NO_SYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        if force || !self.flags.contains(EnvFlags::NO_SYNC) {
            self.store.sync()?;
        }
        Ok(())
    }

    /// Close the environment
    pub fn close(self) {
        debug!("closing environment {}", self.path.display());
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.current.read().clone()
    }

    pub(crate) fn readers(&self) -> &ReaderTable {
        &self.readers
    }

    pub(crate) fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    pub(crate) fn writer(&self) -> &WriterLock {
        &self.writer
    }

    pub(crate) fn store(&self) -> &PageStore {
        &self.store
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// First page number that no longer fits in the map
    pub(crate) fn max_pgno(&self) -> PageNo {
        self.store.map_size() / PAGE_SIZE as u64
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if key.len() > self.max_key_size {
            return Err(Error::KeyTooLarge { size: key.len(), max: self.max_key_size });
        }
        Ok(())
    }

    pub(crate) fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.max_value_size {
            return Err(Error::ValueTooLarge { size: value.len(), max: self.max_value_size });
        }
        Ok(())
    }

    fn poison(&self, err: &Error) -> Error {
        warn!("meta update failed, environment {} needs to be reopened: {}", self.path.display(), err);
        self.poisoned.store(true, Ordering::Release);
        Error::Panic
    }

    /// Write the meta page of a commit and make it the latest snapshot.
    /// `map` is the mapping the committing transaction read from.
    pub(crate) fn publish(&self, meta: Meta, map: &Arc<Mmap>) -> Result<()> {
        let slot = Meta::slot(meta.txn_id);
        let written = self.store.write_page(slot as PageNo, &meta.encode(slot)).and_then(|()| {
            if self.flags.intersects(EnvFlags::NO_SYNC | EnvFlags::NO_META_SYNC) {
                Ok(())
            } else {
                self.store.sync()
            }
        });
        if let Err(e) = written {
            return Err(self.poison(&e));
        }

        let needed = (meta.last_pgno as usize + 1) * PAGE_SIZE;
        let map = if map.len() < needed {
            self.store.map().map_err(|e| self.poison(&e))?
        } else {
            Arc::clone(map)
        };
        *self.current.write() = Snapshot { meta, map };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_bad_configuration() {
        let dir = TempDir::new().unwrap();
        let small = EnvBuilder::new().map_size(PAGE_SIZE).open(dir.path());
        assert!(matches!(small, Err(Error::InvalidConfig(_))));
        let big_keys = EnvBuilder::new().max_key_size(PAGE_SIZE).open(dir.path());
        assert!(matches!(big_keys, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn path_can_only_be_opened_once() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), 1 << 20, 0o600).unwrap();
        assert!(matches!(Environment::open(dir.path(), 1 << 20, 0o600), Err(Error::EnvAlreadyOpen)));
        env.close();
        Environment::open(dir.path(), 1 << 20, 0o600).unwrap();
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let result = Environment::open(dir.path().join("missing"), 1 << 20, 0o600);
        assert!(matches!(result, Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn writer_lock_is_exclusive() {
        let lock = WriterLock::default();
        let guard = lock.acquire(false).unwrap();
        assert!(matches!(lock.acquire(false), Err(Error::WriterBusy)));
        drop(guard);
        assert!(lock.acquire(false).is_ok());
    }
}
