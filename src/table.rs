use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::constants::{TableFlags, WriteFlags};
use crate::cursor::Cursor;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::{compare_bytes, compare_reverse, Comparator, Stat};

/// Table handle
///
/// A handle is opened within a transaction and stays valid for the lifetime
/// of its environment, across transactions, until it is closed or its table
/// is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Table {
    /// Environment the handle belongs to
    env_id: u64,
    /// Table identifier
    dbi: u32,
    /// Distinguishes handles reusing the same identifier
    generation: u64,
}

impl Table {
    /// Open a table, creating it when `flags` contains `CREATE` and the
    /// transaction is writable. `None` names the unnamed default table.
    pub fn open(txn: &mut Transaction<'_>, name: Option<&str>, flags: TableFlags) -> Result<Self> {
        txn.open_table(name, flags)
    }

    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    /// Get a value by key
    pub fn get(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.get(self, key)
    }

    pub fn contains(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<bool> {
        Ok(txn.get(self, key)?.is_some())
    }

    /// Put a key/value pair
    pub fn put(&self, txn: &mut Transaction<'_>, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        txn.put(self, key, data, flags)
    }

    /// Delete a key; returns whether it was present
    pub fn del(&self, txn: &mut Transaction<'_>, key: &[u8]) -> Result<bool> {
        txn.del(self, key)
    }

    /// Create a cursor over this table
    pub fn cursor<'txn>(&self, txn: &'txn Transaction<'_>) -> Result<Cursor<'txn>> {
        txn.cursor(self)
    }

    /// Get table statistics
    pub fn stat(&self, txn: &Transaction<'_>) -> Result<Stat> {
        txn.stat(self)
    }

    /// Persistent flags of the table
    pub fn flags(&self, txn: &Transaction<'_>) -> Result<TableFlags> {
        txn.table_flags(self)
    }

    /// Empty the table, or delete it and close the handle when `del` is set
    pub fn drop(&self, txn: &mut Transaction<'_>, del: bool) -> Result<()> {
        txn.drop_table(self, del)
    }

    /// Set custom comparison function. It must be set before the table is
    /// used and every handle to the table has to use the same order.
    pub fn set_compare(&self, txn: &Transaction<'_>, cmp: Comparator) -> Result<()> {
        txn.set_compare(self, cmp)
    }

    /// Close the handle
    pub fn close(self, env: &Environment) {
        env.close_table(self)
    }
}

/// Registry entry of an open table
#[derive(Debug, Clone)]
pub(crate) struct TableSlot {
    pub name: Option<String>,
    pub flags: TableFlags,
    pub cmp: Comparator,
    generation: u64,
}

/// Open table handles of one environment
#[derive(Debug)]
pub(crate) struct TableRegistry {
    env_id: u64,
    slots: RwLock<Vec<Option<TableSlot>>>,
    max_tables: usize,
    generations: AtomicU64,
}

impl TableRegistry {
    pub fn new(env_id: u64, max_tables: u32) -> Self {
        Self {
            env_id,
            slots: RwLock::new(Vec::new()),
            max_tables: max_tables as usize,
            generations: AtomicU64::new(1),
        }
    }

    fn handle(&self, dbi: usize, slot: &TableSlot) -> Table {
        Table { env_id: self.env_id, dbi: dbi as u32, generation: slot.generation }
    }

    pub fn find(&self, name: Option<&str>) -> Option<Table> {
        let slots = self.slots.read();
        slots.iter().enumerate().find_map(|(dbi, slot)| match slot {
            Some(slot) if slot.name.as_deref() == name => Some(self.handle(dbi, slot)),
            _ => None,
        })
    }

    pub fn register(&self, name: Option<&str>, flags: TableFlags) -> Result<Table> {
        let mut slots = self.slots.write();
        let dbi = match slots.iter().position(Option::is_none) {
            Some(dbi) => dbi,
            None if slots.len() < self.max_tables => {
                slots.push(None);
                slots.len() - 1
            }
            None => return Err(Error::TablesFull),
        };
        let flags = flags & TableFlags::PERSISTENT;
        let slot = TableSlot {
            name: name.map(str::to_owned),
            flags,
            cmp: if flags.contains(TableFlags::REVERSE_KEY) { compare_reverse } else { compare_bytes },
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
        };
        let table = self.handle(dbi, &slot);
        slots[dbi] = Some(slot);
        Ok(table)
    }

    pub fn slot(&self, table: &Table) -> Result<TableSlot> {
        if table.env_id != self.env_id {
            return Err(Error::BadTable);
        }
        match self.slots.read().get(table.dbi as usize) {
            Some(Some(slot)) if slot.generation == table.generation => Ok(slot.clone()),
            _ => Err(Error::BadTable),
        }
    }

    pub fn set_compare(&self, table: &Table, cmp: Comparator) -> Result<()> {
        self.slot(table)?;
        if let Some(Some(slot)) = self.slots.write().get_mut(table.dbi as usize) {
            slot.cmp = cmp;
        }
        Ok(())
    }

    pub fn close(&self, table: &Table) {
        if self.slot(table).is_ok() {
            if let Some(slot) = self.slots.write().get_mut(table.dbi as usize) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_handles_are_rejected() {
        let registry = TableRegistry::new(1, 2);
        let a = registry.register(Some("a"), TableFlags::CREATE).unwrap();
        let b = registry.register(None, TableFlags::REVERSE_KEY).unwrap();
        assert!(matches!(registry.register(Some("c"), TableFlags::empty()), Err(Error::TablesFull)));
        assert_eq!(registry.find(None), Some(b));
        assert_eq!(registry.slot(&a).unwrap().flags, TableFlags::empty());

        registry.close(&a);
        assert!(matches!(registry.slot(&a), Err(Error::BadTable)));
        let c = registry.register(Some("c"), TableFlags::empty()).unwrap();
        assert_eq!(c.dbi(), a.dbi());
        assert!(matches!(registry.slot(&a), Err(Error::BadTable)));

        let foreign = TableRegistry::new(2, 2);
        assert!(matches!(foreign.slot(&c), Err(Error::BadTable)));
    }
}
