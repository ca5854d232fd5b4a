use bitflags::bitflags;

// Environment flags
bitflags! {
    /// Flags accepted by [`EnvBuilder::flags`](crate::EnvBuilder::flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// The path names the data file itself instead of a directory holding `data.mdb`.
        const NO_SUB_DIR = 0x4000;
        /// Skip fsync after commit. A crash may lose the last transactions but never corrupts.
        const NO_SYNC = 0x10000;
        /// Open the data file read-only; write transactions fail.
        const READ_ONLY = 0x20000;
        /// Skip fsync of the meta page only.
        const NO_META_SYNC = 0x40000;
        /// A second writer waits for the write slot instead of failing with `WriterBusy`.
        const WRITER_WAIT = 0x0100_0000;
    }
}

// Table flags
bitflags! {
    /// Flags accepted by [`Table::open`](crate::Table::open).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TableFlags: u32 {
        /// Compare keys from the last byte towards the first.
        const REVERSE_KEY = 0x02;
        /// Create the table if it does not exist (write transactions only).
        const CREATE = 0x40000;
    }
}

impl TableFlags {
    /// Flags recorded in the catalog and checked when a table is reopened.
    pub(crate) const PERSISTENT: TableFlags = TableFlags::REVERSE_KEY;
}

// Write operation flags
bitflags! {
    /// Flags accepted by [`Table::put`](crate::Table::put).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` instead of overwriting an existing key.
        const NO_OVERWRITE = 0x10;
    }
}

// Leaf node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u16 {
        /// Value lives in an overflow chain; the node stores its first page.
        const BIGDATA = 0x01;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
    }
}

// Page and format constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number stamped into both meta pages
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// On-disk format version; bumped whenever the page layout changes
pub const DATA_VERSION: u32 = 1;
/// Meta pages at the start of the file
pub const META_PAGES: usize = 2;
/// Name of the data file inside an environment directory
pub const DATA_FILE_NAME: &str = "data.mdb";

/// Default maximum size of the data file (10 MiB)
pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_TABLES: u32 = 16;
pub const DEFAULT_MAX_KEY_SIZE: usize = 511;
pub const DEFAULT_MAX_VALUE_SIZE: usize = u32::MAX as usize;
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Minimum number of nodes a page must be able to hold
pub const MIN_KEYS: usize = 2;
/// Below this fill (per mille of usable space) a page is rebalanced on delete
pub const FILL_THRESHOLD: usize = 250;
