use tempfile::TempDir;

use crate::btree::{BPlusTree, Direction, decode_i64_key, encode_i64_key};

fn small_tree(tmp: &TempDir) -> BPlusTree {
    // A tiny page size forces splits/merges after only a handful of
    // entries, so structural edge cases exercise without needing a huge
    // fixture.
    BPlusTree::create(tmp.path().join("idx.bpt"), 8, 128, 4).unwrap()
}

#[test]
fn insert_and_find_round_trips() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);

    for i in 0..50i64 {
        tree.insert(&encode_i64_key(i), i * 10).unwrap();
    }
    assert_eq!(tree.count(), 50);

    for i in 0..50i64 {
        let rowid = tree.find(&encode_i64_key(i)).unwrap();
        assert_eq!(rowid, Some(i * 10));
    }
    assert_eq!(tree.find(&encode_i64_key(999)).unwrap(), None);
}

#[test]
fn forward_range_scan_is_sorted() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);

    let mut order: Vec<i64> = (0..200).collect();
    // Insert out of order to make sure the tree, not insertion order,
    // produces sorted output.
    order.sort_by_key(|x| (x * 7919) % 997);
    for &i in &order {
        tree.insert(&encode_i64_key(i), i).unwrap();
    }

    let entries: Vec<i64> = tree
        .range(None, None, Direction::Forward)
        .unwrap()
        .map(|r| decode_i64_key(&r.unwrap().0.try_into().unwrap()))
        .collect();

    let mut expected: Vec<i64> = (0..200).collect();
    expected.sort();
    assert_eq!(entries, expected);
}

#[test]
fn backward_range_scan_is_reverse_sorted() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);
    for i in 0..60i64 {
        tree.insert(&encode_i64_key(i), i).unwrap();
    }

    let entries: Vec<i64> = tree
        .range(None, None, Direction::Backward)
        .unwrap()
        .map(|r| decode_i64_key(&r.unwrap().0.try_into().unwrap()))
        .collect();

    let mut expected: Vec<i64> = (0..60).collect();
    expected.reverse();
    assert_eq!(entries, expected);
}

#[test]
fn bounded_range_respects_start_and_end() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);
    for i in 0..100i64 {
        tree.insert(&encode_i64_key(i), i).unwrap();
    }

    let start = encode_i64_key(20);
    let end = encode_i64_key(30);
    let entries: Vec<i64> = tree
        .range(Some(&start), Some(&end), Direction::Forward)
        .unwrap()
        .map(|r| decode_i64_key(&r.unwrap().0.try_into().unwrap()))
        .collect();

    assert_eq!(entries, (20..30).collect::<Vec<_>>());
}

#[test]
fn delete_removes_entry_and_survives_merges() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);
    for i in 0..80i64 {
        tree.insert(&encode_i64_key(i), i).unwrap();
    }

    for i in (0..80i64).step_by(2) {
        assert!(tree.delete(&encode_i64_key(i), i).unwrap());
    }
    assert_eq!(tree.count(), 40);

    for i in 0..80i64 {
        let found = tree.find(&encode_i64_key(i)).unwrap();
        if i % 2 == 0 {
            assert_eq!(found, None);
        } else {
            assert_eq!(found, Some(i));
        }
    }

    let entries: Vec<i64> = tree
        .range(None, None, Direction::Forward)
        .unwrap()
        .map(|r| decode_i64_key(&r.unwrap().0.try_into().unwrap()))
        .collect();
    assert_eq!(entries, (0..80).filter(|i| i % 2 != 0).collect::<Vec<_>>());
}

#[test]
fn deleting_everything_collapses_to_empty_root() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);
    for i in 0..40i64 {
        tree.insert(&encode_i64_key(i), i).unwrap();
    }
    for i in 0..40i64 {
        assert!(tree.delete(&encode_i64_key(i), i).unwrap());
    }
    assert_eq!(tree.count(), 0);
    assert_eq!(tree.find(&encode_i64_key(0)).unwrap(), None);
    assert_eq!(tree.range(None, None, Direction::Forward).unwrap().count(), 0);
}

#[test]
fn duplicate_keys_are_ordered_by_rowid() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);
    let key = encode_i64_key(7);
    for rowid in [30i64, 10, 20] {
        tree.insert(&key, rowid).unwrap();
    }

    let rowids: Vec<i64> = tree
        .range(Some(&key), None, Direction::Forward)
        .unwrap()
        .take(3)
        .map(|r| r.unwrap().1)
        .collect();
    assert_eq!(rowids, vec![10, 20, 30]);
}

#[test]
fn reopen_after_close_preserves_contents() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("reopen.bpt");
    {
        let tree = BPlusTree::create(&path, 8, 256, 4).unwrap();
        for i in 0..30i64 {
            tree.insert(&encode_i64_key(i), i).unwrap();
        }
        tree.close().unwrap();
    }

    let tree = BPlusTree::open(&path, 4).unwrap();
    assert_eq!(tree.count(), 30);
    for i in 0..30i64 {
        assert_eq!(tree.find(&encode_i64_key(i)).unwrap(), Some(i));
    }
}

#[test]
fn cursor_survives_concurrent_insert_during_iteration() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);
    for i in (0..100i64).step_by(2) {
        tree.insert(&encode_i64_key(i), i).unwrap();
    }

    let mut cursor = tree.range(None, None, Direction::Forward).unwrap();
    let first = cursor.next().unwrap().unwrap();
    assert_eq!(decode_i64_key(&first.0.try_into().unwrap()), 0);

    // Insert enough new keys to force splits and bump the tree's
    // generation counter while the cursor is parked mid-scan.
    for i in (1..100i64).step_by(2) {
        tree.insert(&encode_i64_key(i), i).unwrap();
    }

    let rest: Vec<i64> = cursor.map(|r| decode_i64_key(&r.unwrap().0.try_into().unwrap())).collect();
    // Every key greater than 0 must still show up, in order, even though
    // the tree's shape changed out from under the cursor.
    let mut expected: Vec<i64> = (1..100).collect();
    expected.sort();
    assert_eq!(rest, expected);
}

#[test]
fn i64_key_encoding_preserves_numeric_order() {
    let mut values = vec![i64::MIN, -1000, -1, 0, 1, 1000, i64::MAX];
    let mut encoded: Vec<[u8; 8]> = values.iter().map(|&v| encode_i64_key(v)).collect();
    encoded.sort();
    let decoded: Vec<i64> = encoded.iter().map(decode_i64_key).collect();
    values.sort();
    assert_eq!(decoded, values);
}

#[test]
fn rejects_wrong_key_width() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(&tmp);
    assert!(tree.insert(&[1, 2, 3], 0).is_err());
    assert!(tree.find(&[1, 2, 3]).is_err());
}
