//! End-to-end scenario: a three-shard range map, a lookup through the
//! middle mapping, and a cache round trip on the second lookup.

use meridian_core::{EncodedKey, ShardKeyType, ShardLocation, ShardMapKind};
use meridian_catalog::Catalog;
use meridian_store::global::InMemoryGlobalStore;
use meridian_store::local::InMemoryLocalStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn key(v: i32) -> EncodedKey {
    meridian_core::ShardKeyValue::Int32(v).encode(ShardKeyType::Int32).unwrap()
}

#[tokio::test]
async fn orders_range_map_resolves_key_150_to_db1_and_caches_the_result() {
    let global = Arc::new(InMemoryGlobalStore::new());
    let catalog = Catalog::new(global.clone(), meridian_core::LoadPolicy::Lazy);
    let map = catalog.create_map("Orders", ShardMapKind::Range, ShardKeyType::Int32).await.unwrap();

    let db0 = ShardLocation::new("srv", "db0");
    let db1 = ShardLocation::new("srv", "db1");
    let db2 = ShardLocation::new("srv", "db2");
    for location in [&db0, &db1, &db2] {
        catalog.register_local_store(location.clone(), Arc::new(InMemoryLocalStore::new()));
    }
    let shard0 = catalog.create_shard(&map, db0).await.unwrap();
    let shard1 = catalog.create_shard(&map, db1.clone()).await.unwrap();
    let shard2 = catalog.create_shard(&map, db2).await.unwrap();

    catalog.add_range_mapping(&map, &shard0, key(0), key(100)).await.unwrap();
    catalog.add_range_mapping(&map, &shard1, key(100), key(200)).await.unwrap();
    catalog
        .add_range_mapping(&map, &shard2, key(200), meridian_core::ShardKeyValue::PositiveInfinity.encode(ShardKeyType::Int32).unwrap())
        .await
        .unwrap();

    // A fresh catalog over the same global store simulates a new client
    // process: its cache starts cold, so the first lookup must round-trip
    // through the store.
    let fresh = Catalog::new(global, meridian_core::LoadPolicy::Lazy);
    let misses_before = fresh.metrics().misses.load(Ordering::Relaxed);
    let found = fresh.find_mapping_for_key(&map, &key(150)).unwrap();
    assert_eq!(found, shard1.id);
    assert_eq!(fresh.metrics().misses.load(Ordering::Relaxed), misses_before + 1);

    let hits_before = fresh.metrics().hits.load(Ordering::Relaxed);
    let found_again = fresh.find_mapping_for_key(&map, &key(150)).unwrap();
    assert_eq!(found_again, shard1.id);
    assert_eq!(fresh.metrics().misses.load(Ordering::Relaxed), misses_before + 1, "second lookup must not hit the store again");
    assert!(fresh.metrics().hits.load(Ordering::Relaxed) > hits_before);
}
