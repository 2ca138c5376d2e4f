use tempfile::TempDir;

use crate::hash_index::HashIndex;

fn small_index(tmp: &TempDir) -> HashIndex {
    HashIndex::create(tmp.path().join("idx.hsh"), 1024, 4, 4, 64).unwrap()
}

fn key(n: u32) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

#[test]
fn insert_and_lookup_round_trips() {
    let tmp = TempDir::new().unwrap();
    let idx = small_index(&tmp);

    for i in 0..100u32 {
        idx.insert(&key(i), i as i64).unwrap();
    }
    assert_eq!(idx.count(), 100);

    for i in 0..100u32 {
        let hits = idx.lookup(&key(i)).unwrap();
        assert_eq!(hits, vec![i as i64]);
    }
    assert!(idx.lookup(&key(999)).unwrap().is_empty());
}

#[test]
fn grows_past_initial_capacity_via_overflow_and_rehash() {
    let tmp = TempDir::new().unwrap();
    let idx = small_index(&tmp);

    // Comfortably exceeds 4 buckets' worth of entries at the default load
    // factor threshold, forcing both overflow chaining and at least one
    // rehash before all insertions are done.
    for i in 0..500u32 {
        idx.insert(&key(i), i as i64).unwrap();
    }
    assert_eq!(idx.count(), 500);
    for i in 0..500u32 {
        assert_eq!(idx.lookup(&key(i)).unwrap(), vec![i as i64]);
    }
}

#[test]
fn duplicate_keys_return_every_rowid() {
    let tmp = TempDir::new().unwrap();
    let idx = small_index(&tmp);

    let k = key(42);
    idx.insert(&k, 1).unwrap();
    idx.insert(&k, 2).unwrap();
    idx.insert(&k, 3).unwrap();

    let mut hits = idx.lookup(&k).unwrap();
    hits.sort();
    assert_eq!(hits, vec![1, 2, 3]);
}

#[test]
fn delete_removes_single_entry_without_disturbing_others() {
    let tmp = TempDir::new().unwrap();
    let idx = small_index(&tmp);

    let k = key(7);
    idx.insert(&k, 1).unwrap();
    idx.insert(&k, 2).unwrap();

    assert!(idx.delete(&k, 1).unwrap());
    assert_eq!(idx.lookup(&k).unwrap(), vec![2]);
    assert!(!idx.delete(&k, 1).unwrap());
    assert!(idx.delete(&k, 2).unwrap());
    assert!(idx.lookup(&k).unwrap().is_empty());
}

#[test]
fn no_cross_talk_between_unrelated_keys_after_heavy_churn() {
    let tmp = TempDir::new().unwrap();
    let idx = small_index(&tmp);

    for i in 0..300u32 {
        idx.insert(&key(i), i as i64).unwrap();
    }
    for i in (0..300u32).step_by(3) {
        assert!(idx.delete(&key(i), i as i64).unwrap());
    }
    for i in 0..300u32 {
        let hits = idx.lookup(&key(i)).unwrap();
        if i % 3 == 0 {
            assert!(hits.is_empty(), "key {i} should have been deleted");
        } else {
            assert_eq!(hits, vec![i as i64], "key {i} mismatched");
        }
    }
}

#[test]
fn reopen_after_close_preserves_contents() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("reopen.hsh");
    {
        let idx = HashIndex::create(&path, 1024, 4, 4, 64).unwrap();
        for i in 0..120u32 {
            idx.insert(&key(i), i as i64).unwrap();
        }
        idx.close().unwrap();
    }

    let idx = HashIndex::open(&path, 4).unwrap();
    assert_eq!(idx.count(), 120);
    for i in 0..120u32 {
        assert_eq!(idx.lookup(&key(i)).unwrap(), vec![i as i64]);
    }
}

#[test]
fn respects_max_buckets_cap_via_overflow_chains() {
    let tmp = TempDir::new().unwrap();
    // max_buckets == initial_buckets: growth is disabled, every insertion
    // beyond bucket capacity must succeed via overflow chaining alone.
    let idx = HashIndex::create(tmp.path().join("capped.hsh"), 256, 4, 4, 4).unwrap();

    for i in 0..200u32 {
        idx.insert(&key(i), i as i64).unwrap();
    }
    assert_eq!(idx.count(), 200);
    for i in 0..200u32 {
        assert_eq!(idx.lookup(&key(i)).unwrap(), vec![i as i64]);
    }
}
