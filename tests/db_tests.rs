//! End-to-end behavior of the engine through the public API.

use cinderdb::{
    db, BloomFilterPolicy, Db, Options, ReadOptions, WriteBatch, WriteOptions,
};
use std::sync::Arc;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Db {
    Db::open(Options::new().create_if_missing(true), dir.path()).expect("open failed")
}

fn put(db: &Db, key: &[u8], value: &[u8]) {
    db.put(&WriteOptions::default(), key, value)
        .expect("put failed");
}

fn get(db: &Db, key: &[u8]) -> Option<Vec<u8>> {
    db.get(&ReadOptions::new(), key).expect("get failed")
}

fn num_files_at_level(db: &Db, level: usize) -> usize {
    db.property(&format!("cinderdb.num-files-at-level{level}"))
        .expect("missing property")
        .parse()
        .expect("property is not a number")
}

#[test]
fn test_overwrite_then_delete() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    put(&db, b"foo", b"v1");
    put(&db, b"foo", b"v2");
    assert_eq!(get(&db, b"foo"), Some(b"v2".to_vec()));

    db.delete(&WriteOptions::default(), b"foo")
        .expect("delete failed");
    assert_eq!(get(&db, b"foo"), None);
}

#[test]
fn test_snapshot_sees_old_value() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    put(&db, b"a", b"1");
    let snapshot = db.snapshot();
    put(&db, b"a", b"2");

    assert_eq!(get(&db, b"a"), Some(b"2".to_vec()));
    let at_snapshot = db
        .get(&ReadOptions::new().snapshot(Arc::clone(&snapshot)), b"a")
        .expect("snapshot read failed");
    assert_eq!(at_snapshot, Some(b"1".to_vec()));
    drop(snapshot);
}

#[test]
fn test_snapshot_hides_later_delete() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    put(&db, b"k", b"v");
    let snapshot = db.snapshot();
    db.delete(&WriteOptions::default(), b"k").unwrap();

    assert_eq!(get(&db, b"k"), None);
    let at_snapshot = db
        .get(&ReadOptions::new().snapshot(snapshot), b"k")
        .unwrap();
    assert_eq!(at_snapshot, Some(b"v".to_vec()));
}

#[test]
fn test_bulk_load_reopen_and_iterate() {
    let dir = TempDir::new().unwrap();
    const N: usize = 100_000;
    {
        let db = open(&dir);
        for i in 0..N {
            put(
                &db,
                format!("key{i:05}").as_bytes(),
                format!("v{i}").as_bytes(),
            );
        }
    }

    let db = open(&dir);
    let mut it = db.iter(&ReadOptions::new());
    it.seek(b"key50000");
    for i in 50_000..50_010 {
        assert!(it.valid(), "iterator died at {i}");
        assert_eq!(it.key(), format!("key{i:05}").as_bytes());
        assert_eq!(it.value(), format!("v{i}").as_bytes());
        it.next();
    }
    it.status().expect("iteration error");
}

#[test]
fn test_write_batch_is_atomic_and_ordered() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    let mut batch = WriteBatch::new();
    batch.put(b"x", b"1");
    batch.delete(b"x");
    batch.put(b"x", b"2");
    batch.put(b"y", b"3");
    db.write(&WriteOptions::default(), batch)
        .expect("write failed");

    assert_eq!(get(&db, b"x"), Some(b"2".to_vec()));
    assert_eq!(get(&db, b"y"), Some(b"3".to_vec()));
}

#[test]
fn test_compact_range_moves_everything_off_level0() {
    let dir = TempDir::new().unwrap();
    let options = Options::new()
        .create_if_missing(true)
        .write_buffer_size(256 << 10);
    let db = Db::open(options, dir.path()).expect("open failed");

    // ~2MiB of distinct keys, written small enough to force several
    // memtable rotations.
    let mut keys = Vec::new();
    let mut state = 0x243f_6a88u32;
    for _ in 0..2048 {
        // xorshift; distinct because we fold in a counter below.
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        keys.push(state);
    }
    let value = vec![b'v'; 1000];
    for (i, k) in keys.iter().enumerate() {
        put(&db, format!("{k:08x}-{i}").as_bytes(), &value);
    }

    let level0_before: usize = num_files_at_level(&db, 0);
    let total_before: usize = (0..7).map(|l| num_files_at_level(&db, l)).sum();
    assert!(
        total_before >= 1,
        "expected table files before compaction"
    );
    // The flush-heavy workload should have left something at level 0 at
    // some point; tolerate the background thread having caught up.
    let _ = level0_before;

    db.compact_range(None, None).expect("compact failed");

    assert_eq!(num_files_at_level(&db, 0), 0, "level 0 must be empty");
    let deeper: usize = (1..7).map(|l| num_files_at_level(&db, l)).sum();
    assert!(deeper >= 1, "data must have moved to deeper levels");

    for (i, k) in keys.iter().enumerate() {
        assert_eq!(
            get(&db, format!("{k:08x}-{i}").as_bytes()),
            Some(value.clone()),
            "key {i} lost in compaction"
        );
    }
}

#[test]
fn test_compact_range_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    for i in 0..1000 {
        put(&db, format!("k{i:04}").as_bytes(), b"value");
    }
    db.compact_range(None, None).unwrap();
    let files_after_first: Vec<usize> = (0..7).map(|l| num_files_at_level(&db, l)).collect();
    db.compact_range(None, None).unwrap();
    let files_after_second: Vec<usize> = (0..7).map(|l| num_files_at_level(&db, l)).collect();
    assert_eq!(files_after_first, files_after_second);
    assert_eq!(get(&db, b"k0500"), Some(b"value".to_vec()));
}

#[test]
fn test_compaction_preserves_snapshot_reads() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    for i in 0..100 {
        put(&db, format!("k{i:03}").as_bytes(), b"old");
    }
    let snapshot = db.snapshot();
    for i in 0..100 {
        put(&db, format!("k{i:03}").as_bytes(), b"new");
    }
    db.delete(&WriteOptions::default(), b"k050").unwrap();

    db.compact_range(None, None).expect("compact failed");

    let ropts = ReadOptions::new().snapshot(snapshot);
    for i in 0..100 {
        let got = db.get(&ropts, format!("k{i:03}").as_bytes()).unwrap();
        assert_eq!(got, Some(b"old".to_vec()), "snapshot read of k{i:03}");
    }
    assert_eq!(get(&db, b"k050"), None);
    assert_eq!(get(&db, b"k051"), Some(b"new".to_vec()));
}

#[test]
fn test_iterator_forward_backward_and_flip() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    for key in ["a", "b", "c", "d"] {
        put(&db, key.as_bytes(), key.as_bytes());
    }
    db.delete(&WriteOptions::default(), b"c").unwrap();

    let mut it = db.iter(&ReadOptions::new());
    it.seek_to_first();
    assert_eq!(it.key(), b"a");
    it.next();
    assert_eq!(it.key(), b"b");
    it.next();
    // "c" is deleted.
    assert_eq!(it.key(), b"d");

    it.prev();
    assert_eq!(it.key(), b"b");
    it.prev();
    assert_eq!(it.key(), b"a");
    it.prev();
    assert!(!it.valid());

    it.seek_to_last();
    assert_eq!(it.key(), b"d");
    it.seek(b"bb");
    assert_eq!(it.key(), b"d");
    it.status().expect("iterator error");
}

#[test]
fn test_iterator_is_a_point_in_time_view() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    put(&db, b"a", b"1");
    put(&db, b"c", b"3");

    let mut it = db.iter(&ReadOptions::new());
    put(&db, b"b", b"2"); // after iterator creation

    it.seek_to_first();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push(it.key().to_vec());
        it.next();
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_with_bloom_filter_and_zstd() {
    let dir = TempDir::new().unwrap();
    let options = Options::new()
        .create_if_missing(true)
        .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
        .compression(cinderdb::CompressionType::Zstd)
        .write_buffer_size(128 << 10);
    let db = Db::open(options, dir.path()).expect("open failed");

    for i in 0..2000 {
        put(&db, format!("key{i:06}").as_bytes(), b"some value bytes");
    }
    db.compact_range(None, None).unwrap();

    for i in 0..2000 {
        assert_eq!(
            get(&db, format!("key{i:06}").as_bytes()),
            Some(b"some value bytes".to_vec())
        );
    }
    assert_eq!(get(&db, b"key999999"), None);
}

#[test]
fn test_approximate_sizes_grow_with_data() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let value = vec![b'x'; 10_000];
    for i in 0..500 {
        put(&db, format!("k{i:04}").as_bytes(), &value);
    }
    db.compact_range(None, None).unwrap();

    let sizes = db.approximate_sizes(&[
        (b"k0000".as_slice(), b"k0400".as_slice()),
        (b"k0400".as_slice(), b"k0401".as_slice()),
    ]);
    assert_eq!(sizes.len(), 2);
    assert!(
        sizes[0] > sizes[1],
        "larger range should report more bytes: {sizes:?}"
    );
    assert!(sizes[0] > 100_000, "sizes: {sizes:?}");
}

#[test]
fn test_destroy_db() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let db = Db::open(Options::new().create_if_missing(true), &path).unwrap();
        put(&db, b"k", b"v");
    }
    db::destroy_db(&Options::new(), &path).expect("destroy failed");
    assert!(!path.exists(), "database directory should be gone");
}

#[test]
fn test_get_property_level_files_matches_compaction() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    for i in 0..100 {
        put(&db, format!("{i:04}").as_bytes(), b"v");
    }
    db.compact_range(None, None).unwrap();
    let total: usize = (0..7).map(|l| num_files_at_level(&db, l)).sum();
    assert!(total >= 1);
    assert_eq!(num_files_at_level(&db, 0), 0);
}
