//! Embedded transactional key-value engine: copy-on-write B+Trees in a single
//! memory-mapped file, one writer and any number of snapshot readers.

mod btree;
mod catalog;
pub mod constants;
mod cursor;
mod env;
mod error;
mod freelist;
mod kvs;
mod meta;
mod midl;
mod overflow;
mod page;
mod reader;
mod store;
mod table;
mod transaction;
mod types;

pub use constants::{EnvFlags, TableFlags, WriteFlags};
pub use cursor::{Cursor, Iter};
pub use env::{EnvBuilder, Environment};
pub use error::{Error, Result};
pub use kvs::{Editor, Kvs, KvsConfig, KvsTransaction};
pub use reader::ReaderInfo;
pub use table::Table;
pub use transaction::Transaction;
pub use types::{Comparator, EnvInfo, Stat};
