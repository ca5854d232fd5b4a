use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for environment operations
pub type Result<T> = result::Result<T, Error>;

/// Error kinds returned by the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Disk or mapping failure
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
    /// Meta validation failed or a page does not have the expected layout
    #[error("environment is corrupted: {0}")]
    Corrupted(&'static str),
    /// Data file was written by an incompatible format version
    #[error("data format version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    /// Another write transaction holds the write slot
    #[error("another write transaction is active")]
    WriterBusy,
    /// Operation issued on a committed or aborted transaction
    #[error("transaction is already committed or aborted")]
    TransactionClosed,
    /// Transaction hit a failure that left its dirty state unusable; it must be aborted
    #[error("transaction must be aborted after an earlier failure")]
    BadTxn,
    /// Write operation issued on a read-only transaction
    #[error("transaction is read-only")]
    ReadOnly,
    /// Environment was opened with `READ_ONLY`
    #[error("environment is read-only")]
    EnvReadOnly,
    /// Table does not exist in the catalog
    #[error("table not found")]
    TableNotFound,
    /// Table handle was closed, dropped or belongs to another environment
    #[error("table handle is not open in this environment")]
    BadTable,
    /// Table exists with different persistent flags
    #[error("table flags are incompatible with the stored table")]
    Incompatible,
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// Zero-length keys are not stored
    #[error("key is empty")]
    EmptyKey,
    /// Zero-length values are rejected by the `Kvs` facade
    #[error("value is empty")]
    EmptyValue,
    #[error("key of {size} bytes exceeds the maximum of {max}")]
    KeyTooLarge { size: usize, max: usize },
    #[error("value of {size} bytes exceeds the maximum of {max}")]
    ValueTooLarge { size: usize, max: usize },
    /// Environment map size limit reached
    #[error("environment map size limit reached")]
    MapExhausted,
    /// Environment max readers limit reached
    #[error("environment max readers limit reached")]
    ReadersFull,
    /// Environment max tables limit reached
    #[error("environment max tables limit reached")]
    TablesFull,
    /// Commit did not publish a new meta page; the previous snapshot stays authoritative
    #[error("commit failed: {0}")]
    CommitFailed(#[source] Box<Error>),
    /// Update of the meta page failed; the environment has to be reopened
    #[error("meta page update failed, environment must be reopened")]
    Panic,
    /// The same data file is already open in this process
    #[error("environment is already open in this process")]
    EnvAlreadyOpen,
    #[error("invalid environment configuration: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// Whether the caller may retry the operation without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WriterBusy | Error::ReadersFull | Error::MapExhausted)
    }

    /// Whether the error means the on-disk structure is not what the engine expects.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupted(_) | Error::VersionMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_failure_keeps_source() {
        let err = Error::CommitFailed(Box::new(Error::MapExhausted));
        let source = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(source.as_deref(), Some("environment map size limit reached"));
    }

    #[test]
    fn transient_errors() {
        assert!(Error::WriterBusy.is_transient());
        assert!(!Error::TransactionClosed.is_transient());
        assert!(Error::Corrupted("bad page").is_corruption());
    }
}
