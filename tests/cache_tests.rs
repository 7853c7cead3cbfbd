//! Integration tests for the per-entity KV cache and the shared prefix cache.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tier_router::cache::entry::{decode_tokens, encode_tokens};
use tier_router::cache::manager::KvCacheManager;
use tier_router::config::CacheConfig;

fn cache(capacity_bytes: usize) -> KvCacheManager {
    KvCacheManager::new(
        "test",
        &CacheConfig {
            capacity_bytes,
            ..Default::default()
        },
    )
}

fn state(len: usize) -> Bytes {
    Bytes::from(vec![7u8; len])
}

#[test]
fn test_lru_among_unpinned() {
    let cache = cache(64);
    cache.put("npc-a", state(32));
    std::thread::sleep(Duration::from_millis(2));
    cache.put("npc-b", state(32));
    std::thread::sleep(Duration::from_millis(2));

    // Touch A so B becomes the least recently used.
    assert!(cache.get("npc-a").is_some());
    std::thread::sleep(Duration::from_millis(2));
    cache.put("npc-c", state(32));

    assert!(cache.contains("npc-a"));
    assert!(!cache.contains("npc-b"));
    assert!(cache.contains("npc-c"));
    assert_eq!(cache.bytes_used(), 64);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_pinned_entry_survives_pressure() {
    let cache = cache(64);
    cache.put("npc-1", state(32));
    let guard = cache.pin("npc-1");

    for i in 2..12 {
        std::thread::sleep(Duration::from_millis(1));
        cache.put(&format!("npc-{i}"), state(32));
        assert!(cache.contains("npc-1"), "pinned entry evicted at npc-{i}");
        assert!(cache.bytes_used() <= 64);
    }

    drop(guard);
    assert!(!cache.is_pinned("npc-1"));
    std::thread::sleep(Duration::from_millis(1));
    cache.put("npc-12", state(32));
    cache.put("npc-13", state(32));
    assert!(!cache.contains("npc-1"));
}

#[test]
fn test_everything_pinned_overflows_instead_of_evicting() {
    let cache = cache(32);
    cache.pin_manual("npc-1");
    cache.put("npc-1", state(32));
    cache.pin_manual("npc-2");
    cache.put("npc-2", state(32));

    assert_eq!(cache.bytes_used(), 64);
    assert_eq!(cache.evict_to_capacity(), 0);

    assert!(cache.unpin("npc-1"));
    assert_eq!(cache.evict_to_capacity(), 1);
    assert!(cache.contains("npc-2"));
}

#[test]
fn test_decode_state_round_trips_through_cache() {
    let cache = cache(1 << 20);
    let window = vec![3, 1, 4, 1, 5, 9, 2, 6];
    cache.put("npc-7", encode_tokens(&window));
    let entry = cache.get("npc-7").unwrap();
    assert_eq!(decode_tokens(&entry.kv_blocks), window);
    assert_eq!(entry.size, window.len() * 4);
}

#[test]
fn test_prefix_shared_across_entities() {
    let cache = cache(1 << 20);
    let system = "You are the innkeeper of the Drowned Rat.";

    let (first, hit) = cache
        .prefix_cache()
        .get_or_insert_with(system, || vec![10, 11, 12]);
    assert!(!hit);

    let (second, hit) = cache
        .prefix_cache()
        .get_or_insert_with(system, || panic!("prefix recomputed"));
    assert!(hit);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.stats().prefix_entries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_puts_keep_accounting_exact() {
    let cache = Arc::new(cache(16 * 200));
    let mut handles = Vec::new();
    for worker in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            for i in 0..100 {
                let entity = format!("npc-{worker}-{i}");
                let _pin = cache.pin(&entity);
                cache.put(&entity, state(16));
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    cache.evict_to_capacity();
    assert!(cache.bytes_used() <= 16 * 200);
    assert_eq!(cache.bytes_used(), cache.len() * 16);
}
