use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::TxnId;

/// Reader info matching an MDB_reader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Process ID
    pub pid: u32,
    /// Thread that began the read transaction
    pub thread: ThreadId,
    /// Snapshot the reader is pinned to
    pub txn_id: TxnId,
}

/// Reader lock table matching MDB_txninfo
#[derive(Debug)]
pub(crate) struct ReaderTable {
    slots: Mutex<Vec<Option<ReaderInfo>>>,
    max_readers: usize,
}

impl ReaderTable {
    pub fn new(max_readers: u32) -> Self {
        Self { slots: Mutex::new(Vec::new()), max_readers: max_readers as usize }
    }

    /// Claim a slot for the snapshot returned by `snapshot`. The closure runs
    /// under the table lock, so a writer computing the oldest reader either
    /// sees this reader or ran before the snapshot was taken.
    pub fn register_with<T>(&self, snapshot: impl FnOnce() -> (TxnId, T)) -> Result<(ReaderSlot<'_>, T)> {
        let mut slots = self.slots.lock();
        let index = match slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if slots.len() < self.max_readers => {
                slots.push(None);
                slots.len() - 1
            }
            None => return Err(Error::ReadersFull),
        };
        let (txn_id, value) = snapshot();
        slots[index] = Some(ReaderInfo { pid: std::process::id(), thread: thread::current().id(), txn_id });
        Ok((ReaderSlot { table: self, index }, value))
    }

    /// Oldest snapshot still pinned by a reader
    pub fn min_active_snapshot(&self) -> Option<TxnId> {
        self.slots.lock().iter().flatten().map(|r| r.txn_id).min()
    }

    pub fn list(&self) -> Vec<ReaderInfo> {
        self.slots.lock().iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    fn release(&self, index: usize) {
        if let Some(slot) = self.slots.lock().get_mut(index) {
            *slot = None;
        }
    }
}

/// Registration of one read transaction; the slot is cleared on drop
#[derive(Debug)]
pub(crate) struct ReaderSlot<'a> {
    table: &'a ReaderTable,
    index: usize,
}

impl Drop for ReaderSlot<'_> {
    fn drop(&mut self) {
        self.table.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_oldest_snapshot() {
        let table = ReaderTable::new(4);
        assert_eq!(table.min_active_snapshot(), None);
        let (a, _) = table.register_with(|| (5, ())).unwrap();
        let (b, _) = table.register_with(|| (3, ())).unwrap();
        assert_eq!(table.min_active_snapshot(), Some(3));
        drop(b);
        assert_eq!(table.min_active_snapshot(), Some(5));
        assert_eq!(table.list()[0].pid, std::process::id());
        drop(a);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn slots_are_bounded_and_reused() {
        let table = ReaderTable::new(2);
        let (a, _) = table.register_with(|| (1, ())).unwrap();
        let (_b, _) = table.register_with(|| (1, ())).unwrap();
        assert!(matches!(table.register_with(|| (1, ())), Err(Error::ReadersFull)));
        drop(a);
        let (_c, value) = table.register_with(|| (2, "snapshot")).unwrap();
        assert_eq!(value, "snapshot");
        assert_eq!(table.len(), 2);
    }
}
