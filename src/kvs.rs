//! Minimal key-value store over the default table of an environment.
//!
//! Every `Kvs` call runs in its own transaction; `with_transaction` and
//! `edit` group several operations into one.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::constants::{TableFlags, WriteFlags, DATA_FILE_NAME, DEFAULT_MAP_SIZE};
use crate::env::{EnvBuilder, Environment};
use crate::error::{Error, Result};
use crate::table::Table;
use crate::transaction::Transaction;

/// File permissions of a data file created by the facade
const KVS_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvsConfig {
    /// Existing directory this process can read and write, holding the data file
    pub dir: PathBuf,
    map_size: usize,
}

impl KvsConfig {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), map_size: DEFAULT_MAP_SIZE }
    }

    /// Maximum size of the data file
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("missing directory"));
        }
        let meta = match fs::metadata(&self.dir) {
            Ok(meta) => meta,
            Err(_) => return Err(Error::InvalidConfig("directory does not exist")),
        };
        if !meta.is_dir() {
            return Err(Error::InvalidConfig("path is not a directory"));
        }
        // the effective access of this process, not the mode bits
        if fs::read_dir(&self.dir).is_err() {
            return Err(Error::InvalidConfig("directory is not readable"));
        }
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(KVS_FILE_MODE)
            .open(self.dir.join(DATA_FILE_NAME))
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(Error::InvalidConfig("directory is not writable"))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<()> {
    if value.is_empty() {
        return Err(Error::EmptyValue);
    }
    Ok(())
}

/// Key-value store backed by one environment
#[derive(Debug)]
pub struct Kvs {
    env: Environment,
    table: Table,
}

impl Kvs {
    pub fn open(config: KvsConfig) -> Result<Self> {
        config.validate()?;
        let env = EnvBuilder::new().map_size(config.map_size).mode(KVS_FILE_MODE).open(&config.dir)?;
        let table = {
            let mut txn = env.begin_txn()?;
            let table = Table::open(&mut txn, None, TableFlags::CREATE)?;
            txn.commit()?;
            table
        };
        debug!("opened kvs in {}", config.dir.display());
        Ok(Self { env, table })
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.with_transaction(true, |txn| txn.contains(key))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_transaction(true, |txn| txn.get(key))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_transaction(false, |txn| txn.set(key, value))
    }

    /// Remove a key; returns whether it was present
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.with_transaction(false, |txn| txn.remove(key))
    }

    /// Run `f` in one transaction. A writable transaction is committed when
    /// `f` succeeds and aborted when it fails.
    pub fn with_transaction<T, F>(&self, read_only: bool, f: F) -> Result<T>
    where
        F: FnOnce(&mut KvsTransaction<'_>) -> Result<T>,
    {
        let mut txn = KvsTransaction { txn: self.env.begin_transaction(read_only)?, table: self.table };
        match f(&mut txn) {
            Ok(value) => {
                txn.txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.txn.abort();
                Err(e)
            }
        }
    }

    /// Start a batch of writes committed explicitly
    pub fn edit(&self) -> Result<Editor<'_>> {
        Ok(Editor { txn: self.env.begin_txn()?, table: self.table })
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn close(self) {
        self.env.close();
    }
}

/// Access to the store inside [`Kvs::with_transaction`]
#[derive(Debug)]
pub struct KvsTransaction<'env> {
    txn: Transaction<'env>,
    table: Table,
}

impl KvsTransaction<'_> {
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        self.table.contains(&self.txn, key)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        self.table.get(&self.txn, key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        check_value(value)?;
        self.table.put(&mut self.txn, key, value, WriteFlags::empty())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        self.table.del(&mut self.txn, key)
    }
}

/// Write batch returned by [`Kvs::edit`]. Dropping it without `commit` aborts.
///
/// An empty key or value aborts the whole batch before the error is returned.
#[derive(Debug)]
pub struct Editor<'env> {
    txn: Transaction<'env>,
    table: Table,
}

impl Editor<'_> {
    fn abort_on<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.txn.abort();
        }
        result
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let checked = check_key(key).and_then(|()| check_value(value));
        self.abort_on(checked)?;
        self.table.put(&mut self.txn, key, value, WriteFlags::empty())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.abort_on(check_key(key))?;
        self.table.del(&mut self.txn, key)
    }

    /// Reads see the batch's own uncommitted writes
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        self.table.get(&self.txn, key)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn commit(mut self) -> Result<()> {
        self.txn.commit()
    }

    pub fn abort(mut self) {
        self.txn.abort();
    }
}
