//  Copyright 2024 Burrow Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use burrow::{
    Cache, EvictReason, EvictionConfig, HashRing, LockManager, Peer, ReadThroughCache,
    RetryStrategy,
};
use parking_lot::Mutex;

fn capacity_three(eviction: EvictionConfig) -> Cache<u64> {
    Cache::builder()
        .with_max_memory(0)
        .with_max_count(3)
        .with_default_ttl(Duration::ZERO)
        .with_eviction(eviction)
        .build()
}

#[test]
fn test_lru_evicts_least_recently_used() {
    let cache = capacity_three(EvictionConfig::Lru);
    cache.insert("a", 1).unwrap();
    cache.insert("b", 1).unwrap();
    cache.insert("c", 1).unwrap();
    cache.get("a").unwrap();
    cache.insert("d", 1).unwrap();

    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert!(cache.contains("c"));
    assert!(cache.contains("d"));
}

#[test]
fn test_fifo_evicts_earliest_inserted() {
    let cache = capacity_three(EvictionConfig::Fifo);
    cache.insert("a", 1).unwrap();
    cache.insert("b", 1).unwrap();
    cache.insert("c", 1).unwrap();
    cache.get("a").unwrap();
    cache.insert("d", 1).unwrap();

    assert!(!cache.contains("a"));
    assert!(cache.contains("b"));
    assert!(cache.contains("c"));
    assert!(cache.contains("d"));
}

#[test]
fn test_expiry_fires_listener() {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    let cache: Cache<&'static str> = Cache::builder()
        .with_event_listener(move |key: &str, _: Arc<&'static str>, reason: EvictReason| {
            sink.lock().push((key.to_string(), reason));
        })
        .build();

    cache
        .insert_with_ttl("k", "v", Duration::from_millis(100))
        .unwrap();
    std::thread::sleep(Duration::from_millis(200));

    assert!(cache.get("k").is_err());
    assert_eq!(
        reasons.lock().as_slice(),
        &[("k".to_string(), EvictReason::Expired)]
    );
}

#[test_log::test(tokio::test)]
async fn test_read_through_coalesces_concurrent_loads() {
    let rt = Arc::new(ReadThroughCache::new(Cache::builder().build()));
    let loads = Arc::new(AtomicUsize::new(0));

    let tasks = (0..32)
        .map(|_| {
            let rt = rt.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                rt.get_or_load("user:1", move |_| async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok("alice".to_string())
                })
                .await
                .unwrap()
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        assert_eq!(*task.await.unwrap(), "alice");
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

fn three_peers() -> HashRing {
    let ring = HashRing::builder().build().unwrap();
    ring.add_peers([
        Peer::new("p1", "10.0.0.1:7000"),
        Peer::new("p2", "10.0.0.2:7000"),
        Peer::new("p3", "10.0.0.3:7000"),
    ])
    .unwrap();
    ring
}

#[test]
fn test_ring_routing_survives_peer_removal() {
    let ring = three_peers();
    let owner = ring.get("user:12345").unwrap();
    // deterministic for a fixed (peers, hash, replicas) configuration
    assert_eq!(ring.get("user:12345").unwrap().id, owner.id);

    ring.remove_peers([owner.id.as_str()]);
    let fallback = ring.get("user:12345").unwrap();
    assert_ne!(fallback.id, owner.id);
    assert!(["p1", "p2", "p3"].contains(&fallback.id.as_str()));
}

#[test]
fn test_ring_replica_selection() {
    let ring = three_peers();
    let replicas = ring.get_n("user:12345", 2).unwrap();
    assert_eq!(replicas.len(), 2);
    assert_ne!(replicas[0].id, replicas[1].id);
}

#[tokio::test]
async fn test_lock_contention_resolves_after_expiry() {
    let manager = LockManager::new();

    let held = manager.try_lock("r", Duration::from_secs(1)).unwrap();
    assert_eq!(
        manager.try_lock("r", Duration::from_secs(1)).unwrap_err(),
        burrow::lock::Error::Busy
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let reacquired = manager.try_lock("r", Duration::from_secs(1)).unwrap();
    assert!(manager.is_valid(&reacquired));
    assert!(!manager.is_valid(&held));
}

#[tokio::test]
async fn test_lock_auto_refresh_outlives_its_ttl() {
    let manager = LockManager::new();
    let handle = manager.try_lock("r", Duration::from_millis(200)).unwrap();
    let refresher = manager
        .spawn_auto_refresh(&handle, Duration::from_millis(50), Duration::from_millis(50))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(manager.is_valid(&handle));

    manager.unlock(&handle).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(refresher.is_finished());
}

#[tokio::test]
async fn test_lock_retry_budget() {
    let manager = LockManager::new();
    let _held = manager.try_lock("r", Duration::from_secs(5)).unwrap();

    let retry = RetryStrategy::fixed(Duration::from_millis(10), 3).unwrap();
    let err = manager
        .lock("r", Duration::from_secs(1), Duration::from_secs(5), &retry)
        .await
        .unwrap_err();
    assert_eq!(err, burrow::lock::Error::Busy);
}
