use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;

use kvs::{Error, Kvs, KvsConfig};
use tempfile::TempDir;

fn open_kvs() -> (TempDir, Kvs) {
    let dir = TempDir::new().unwrap();
    let kvs = Kvs::open(KvsConfig::new(dir.path())).unwrap();
    (dir, kvs)
}

#[test]
fn config_is_validated() {
    let dir = TempDir::new().unwrap();
    let missing = Kvs::open(KvsConfig::new(dir.path().join("missing")));
    assert!(matches!(missing, Err(Error::InvalidConfig(_))));

    let file = dir.path().join("file");
    std::fs::write(&file, b"not a directory").unwrap();
    assert!(matches!(Kvs::open(KvsConfig::new(&file)), Err(Error::InvalidConfig(_))));
    assert!(matches!(Kvs::open(KvsConfig::new("")), Err(Error::InvalidConfig(_))));
}

/// Opens `dir` with its mode set to `mode`. Returns `None` when the process
/// ignores mode bits (running as root), since there is nothing to check then.
fn open_with_mode(dir: &TempDir, mode: u32, allowed: impl Fn(&TempDir) -> bool) -> Option<kvs::Result<Kvs>> {
    fs::set_permissions(dir.path(), Permissions::from_mode(mode)).unwrap();
    let result = if allowed(dir) { None } else { Some(Kvs::open(KvsConfig::new(dir.path()))) };
    fs::set_permissions(dir.path(), Permissions::from_mode(0o700)).unwrap();
    result
}

#[test]
fn directory_access_is_checked() {
    let dir = TempDir::new().unwrap();
    let unwritable = open_with_mode(&dir, 0o500, |d| fs::write(d.path().join("scratch"), b"").is_ok());
    if let Some(result) = unwritable {
        assert!(matches!(result, Err(Error::InvalidConfig("directory is not writable"))));
    }

    let dir = TempDir::new().unwrap();
    let unreadable = open_with_mode(&dir, 0o300, |d| fs::read_dir(d.path()).is_ok());
    if let Some(result) = unreadable {
        assert!(matches!(result, Err(Error::InvalidConfig("directory is not readable"))));
    }
}

#[test]
fn set_get_remove() {
    let (_dir, kvs) = open_kvs();
    assert!(!kvs.contains(b"key").unwrap());
    assert_eq!(kvs.get(b"key").unwrap(), None);

    kvs.set(b"key", b"value").unwrap();
    assert!(kvs.contains(b"key").unwrap());
    assert_eq!(kvs.get(b"key").unwrap(), Some(b"value".to_vec()));

    kvs.set(b"key", b"other").unwrap();
    assert_eq!(kvs.get(b"key").unwrap(), Some(b"other".to_vec()));

    assert!(kvs.remove(b"key").unwrap());
    assert!(!kvs.remove(b"key").unwrap());
    assert_eq!(kvs.get(b"key").unwrap(), None);
}

#[test]
fn empty_keys_and_values_are_rejected() {
    let (_dir, kvs) = open_kvs();
    assert!(matches!(kvs.get(b""), Err(Error::EmptyKey)));
    assert!(matches!(kvs.contains(b""), Err(Error::EmptyKey)));
    assert!(matches!(kvs.set(b"", b"v"), Err(Error::EmptyKey)));
    assert!(matches!(kvs.set(b"k", b""), Err(Error::EmptyValue)));
    assert!(matches!(kvs.remove(b""), Err(Error::EmptyKey)));
}

#[test]
fn values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let kvs = Kvs::open(KvsConfig::new(dir.path())).unwrap();
        kvs.set(b"persistent", b"yes").unwrap();
        kvs.close();
    }
    let kvs = Kvs::open(KvsConfig::new(dir.path()).map_size(2 << 20)).unwrap();
    assert_eq!(kvs.get(b"persistent").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn transaction_commits_on_success() {
    let (_dir, kvs) = open_kvs();
    let seen = kvs
        .with_transaction(false, |txn| {
            txn.set(b"a", b"1")?;
            txn.set(b"b", b"2")?;
            txn.remove(b"a")?;
            txn.get(b"b")
        })
        .unwrap();
    assert_eq!(seen, Some(b"2".to_vec()));
    assert_eq!(kvs.get(b"a").unwrap(), None);
    assert_eq!(kvs.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn transaction_aborts_on_error() {
    let (_dir, kvs) = open_kvs();
    let result = kvs.with_transaction(false, |txn| {
        txn.set(b"a", b"1")?;
        txn.set(b"b", b"")
    });
    assert!(matches!(result, Err(Error::EmptyValue)));
    assert!(!kvs.contains(b"a").unwrap());

    let read_only = kvs.with_transaction(true, |txn| txn.set(b"a", b"1"));
    assert!(matches!(read_only, Err(Error::ReadOnly)));
    assert!(!kvs.contains(b"a").unwrap());

    let count = kvs.with_transaction(true, |txn| Ok(txn.contains(b"a")? as u32)).unwrap();
    assert_eq!(count, 0);
}

#[test]
fn editor_batches_writes() {
    let (_dir, kvs) = open_kvs();
    let mut editor = kvs.edit().unwrap();
    editor.set(b"one", b"1").unwrap();
    editor.set(b"two", b"2").unwrap();
    assert!(editor.contains(b"one").unwrap());
    assert!(editor.remove(b"one").unwrap());
    assert_eq!(editor.get(b"two").unwrap(), Some(b"2".to_vec()));

    // Only one batch can be open at a time
    assert!(matches!(kvs.set(b"three", b"3"), Err(Error::WriterBusy)));
    assert_eq!(kvs.get(b"two").unwrap(), None);

    editor.commit().unwrap();
    assert_eq!(kvs.get(b"one").unwrap(), None);
    assert_eq!(kvs.get(b"two").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn editor_abort_and_drop_discard_writes() {
    let (_dir, kvs) = open_kvs();
    let mut editor = kvs.edit().unwrap();
    editor.set(b"a", b"1").unwrap();
    editor.abort();

    {
        let mut editor = kvs.edit().unwrap();
        editor.set(b"b", b"1").unwrap();
    }

    assert!(!kvs.contains(b"a").unwrap());
    assert!(!kvs.contains(b"b").unwrap());
}

#[test]
fn editor_aborts_on_empty_input() {
    let (_dir, kvs) = open_kvs();
    let mut editor = kvs.edit().unwrap();
    editor.set(b"kept", b"1").unwrap();
    assert!(matches!(editor.set(b"bad", b""), Err(Error::EmptyValue)));

    // The batch is gone, including the writes before the bad one
    assert!(matches!(editor.set(b"more", b"2"), Err(Error::TransactionClosed)));
    assert!(matches!(editor.commit(), Err(Error::TransactionClosed)));
    assert!(!kvs.contains(b"kept").unwrap());

    let mut editor = kvs.edit().unwrap();
    assert!(matches!(editor.remove(b""), Err(Error::EmptyKey)));
    assert!(matches!(editor.remove(b"k"), Err(Error::TransactionClosed)));
}
