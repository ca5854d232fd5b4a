use kvs::{EnvBuilder, Environment, Error, Table, TableFlags, WriteFlags};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), 1 << 20, 0o644).unwrap();
    (temp_dir, env)
}

#[test]
fn test_table_open_close() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();

    // Test opening default table
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();
    assert_eq!(table.flags(&txn).unwrap(), TableFlags::empty());

    // Test opening named table
    let named = Table::open(&mut txn, Some("testdb"), TableFlags::CREATE).unwrap();
    assert_ne!(named, table);
    txn.commit().unwrap();

    named.close(&env);
    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(named.get(&txn, b"k"), Err(Error::BadTable)));
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    table.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    let result = table.get(&txn, key).unwrap();

    assert_eq!(result.unwrap(), value);
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    table.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    assert!(table.get(&txn, key).unwrap().is_some());

    assert!(table.del(&mut txn, key).unwrap());
    assert!(table.get(&txn, key).unwrap().is_none());
    assert!(!table.del(&mut txn, key).unwrap());
}

#[test]
fn test_table_stats() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();

    // Get initial stats
    let stats = table.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.depth, 1);

    // Add some entries and check stats
    for i in 0..5 {
        let key = format!("key_{}", i);
        let value = format!("value_{}", i);
        table.put(&mut txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty()).unwrap();
    }

    let stats = table.stat(&txn).unwrap();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.page_size, 4096);
}

#[test]
fn test_committed_writes_are_visible() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();
    table.put(&mut txn, b"a", b"1", WriteFlags::empty()).unwrap();
    table.put(&mut txn, b"b", b"2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(table.get(&txn, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(table.get(&txn, b"c").unwrap(), None);
    assert!(table.contains(&txn, b"b").unwrap());
}

#[test]
fn test_no_overwrite() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();
    table.put(&mut txn, b"k", b"first", WriteFlags::NO_OVERWRITE).unwrap();
    let again = table.put(&mut txn, b"k", b"second", WriteFlags::NO_OVERWRITE);
    assert!(matches!(again, Err(Error::KeyExist)));
    assert_eq!(table.get(&txn, b"k").unwrap(), Some(b"first".to_vec()));

    table.put(&mut txn, b"k", b"second", WriteFlags::empty()).unwrap();
    assert_eq!(table.get(&txn, b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn test_key_and_value_limits() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().max_key_size(16).max_value_size(64).open(dir.path()).unwrap();
    let mut txn = env.begin_txn().unwrap();
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();

    let long_key = [b'k'; 17];
    let put = table.put(&mut txn, &long_key, b"v", WriteFlags::empty());
    assert!(matches!(put, Err(Error::KeyTooLarge { size: 17, max: 16 })));
    let put = table.put(&mut txn, b"k", &[0u8; 65], WriteFlags::empty());
    assert!(matches!(put, Err(Error::ValueTooLarge { size: 65, max: 64 })));
    assert!(matches!(table.put(&mut txn, b"", b"v", WriteFlags::empty()), Err(Error::EmptyKey)));

    // Rejected writes leave the transaction usable
    table.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_large_value_round_trip() {
    let (_dir, env) = setup_test_env();
    let value: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 251) as u8).collect();

    let mut txn = env.begin_txn().unwrap();
    let table = Table::open(&mut txn, None, TableFlags::CREATE).unwrap();
    table.put(&mut txn, b"big", &value, WriteFlags::empty()).unwrap();
    table.put(&mut txn, b"small", b"s", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(table.get(&txn, b"big").unwrap(), Some(value.clone()));
    let stats = table.stat(&txn).unwrap();
    assert_eq!(stats.overflow_pages, 5);
    drop(txn);

    // Shrinking the value releases its overflow chain
    let mut txn = env.begin_txn().unwrap();
    table.put(&mut txn, b"big", b"tiny", WriteFlags::empty()).unwrap();
    assert_eq!(table.stat(&txn).unwrap().overflow_pages, 0);
    txn.commit().unwrap();
}
