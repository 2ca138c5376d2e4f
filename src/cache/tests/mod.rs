use crate::cache::{Cache, CacheConfig};

fn single_shard_cache(capacity: usize) -> Cache<u64, String> {
    Cache::new(CacheConfig { per_shard_capacity: capacity, shards: 1 })
}

#[test]
fn insert_then_get_round_trips() {
    let cache = single_shard_cache(4);
    cache.insert(1, "one".to_string());
    assert_eq!(cache.get(&1), Some("one".to_string()));
    assert_eq!(cache.get(&2), None);
}

#[test]
fn eviction_drops_least_recently_used() {
    let cache = single_shard_cache(2);
    cache.insert(1, "a".to_string());
    cache.insert(2, "b".to_string());
    // Touch 1 so it becomes most-recently-used, leaving 2 as the next
    // eviction victim.
    assert_eq!(cache.get(&1), Some("a".to_string()));
    cache.insert(3, "c".to_string());

    assert_eq!(cache.get(&1), Some("a".to_string()));
    assert_eq!(cache.get(&2), None);
    assert_eq!(cache.get(&3), Some("c".to_string()));
    assert_eq!(cache.len(), 2);
}

#[test]
fn insert_overwrites_existing_key_and_refreshes_recency() {
    let cache = single_shard_cache(2);
    cache.insert(1, "a".to_string());
    cache.insert(2, "b".to_string());
    cache.insert(1, "a2".to_string());
    cache.insert(3, "c".to_string());

    // 1 was refreshed by the overwrite, so 2 should be the one evicted.
    assert_eq!(cache.get(&1), Some("a2".to_string()));
    assert_eq!(cache.get(&2), None);
    assert_eq!(cache.get(&3), Some("c".to_string()));
}

#[test]
fn invalidate_removes_entry() {
    let cache = single_shard_cache(4);
    cache.insert(1, "a".to_string());
    assert!(cache.invalidate(&1));
    assert_eq!(cache.get(&1), None);
    assert!(!cache.invalidate(&1));
}

#[test]
fn clear_empties_every_shard() {
    let cache = Cache::new(CacheConfig { per_shard_capacity: 8, shards: 4 });
    for i in 0..20u64 {
        cache.insert(i, i.to_string());
    }
    assert!(cache.len() > 0);
    cache.clear();
    assert_eq!(cache.len(), 0);
    for i in 0..20u64 {
        assert_eq!(cache.get(&i), None);
    }
}

#[test]
fn stats_track_hits_misses_and_evictions() {
    let cache = single_shard_cache(1);
    cache.insert(1, "a".to_string());
    let _ = cache.get(&1); // hit
    let _ = cache.get(&2); // miss
    cache.insert(2, "b".to_string()); // evicts 1

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.len, 1);
}

#[test]
fn with_total_capacity_splits_evenly_across_shards() {
    let config = CacheConfig::with_total_capacity(100, 4);
    assert_eq!(config.shards, 4);
    assert_eq!(config.per_shard_capacity, 25);
}

#[test]
fn distinct_keys_spread_across_many_shards_all_round_trip() {
    let cache = Cache::new(CacheConfig { per_shard_capacity: 32, shards: 16 });
    for i in 0..400u64 {
        cache.insert(i, format!("value-{i}"));
    }
    // With 16 shards of capacity 32 each (512 total) nothing should have
    // been evicted yet.
    for i in 0..400u64 {
        assert_eq!(cache.get(&i), Some(format!("value-{i}")));
    }
}
