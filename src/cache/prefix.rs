//! Shared prefix cache.
//!
//! Many entities share the same constant system-prompt segment. Its prefill is
//! computed once, keyed by a SHA-256 of the segment, and reused. The map is
//! read-mostly: readers clone an `Arc` of the current map, writers build a
//! modified copy and swap the pointer, so readers never wait on a writer's work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::inference::model::TokenId;

pub type PrefixKey = [u8; 32];

/// Hash a system-prompt segment into a prefix key.
pub fn prefix_key(segment: &str) -> PrefixKey {
    let digest = Sha256::digest(segment.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

#[derive(Debug)]
pub struct PrefixEntry {
    pub key: PrefixKey,
    pub tokens: Arc<[TokenId]>,
    pub created_at: Instant,
    hits: AtomicU64,
}

impl PrefixEntry {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

type PrefixMap = HashMap<PrefixKey, Arc<PrefixEntry>>;

pub struct SharedPrefixCache {
    current: RwLock<Arc<PrefixMap>>,
    /// Serializes writers; readers never take it.
    write_gate: Mutex<()>,
    capacity: usize,
}

impl SharedPrefixCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            write_gate: Mutex::new(()),
            capacity: capacity.max(1),
        }
    }

    fn map(&self) -> Arc<PrefixMap> {
        Arc::clone(&self.current.read())
    }

    pub fn get(&self, key: &PrefixKey) -> Option<Arc<PrefixEntry>> {
        let entry = self.map().get(key).cloned();
        if let Some(entry) = &entry {
            entry.hits.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Insert a prefix (copy-on-write). An existing entry for the key wins.
    pub fn insert(&self, key: PrefixKey, tokens: Vec<TokenId>) -> Arc<PrefixEntry> {
        let _gate = self.write_gate.lock();
        let base = self.map();
        if let Some(existing) = base.get(&key) {
            return Arc::clone(existing);
        }

        let mut next = PrefixMap::clone(&base);
        if next.len() >= self.capacity {
            // Drop the least-hit prefix, oldest first on ties.
            if let Some(victim) = next
                .values()
                .min_by(|a, b| a.hits().cmp(&b.hits()).then(a.created_at.cmp(&b.created_at)))
                .map(|e| e.key)
            {
                next.remove(&victim);
            }
        }

        let entry = Arc::new(PrefixEntry {
            key,
            tokens: tokens.into(),
            created_at: Instant::now(),
            hits: AtomicU64::new(0),
        });
        next.insert(key, Arc::clone(&entry));
        *self.current.write() = Arc::new(next);
        entry
    }

    /// Look up a segment's prefill, computing and publishing it on a miss.
    ///
    /// Returns the entry and whether it was a hit.
    pub fn get_or_insert_with(
        &self,
        segment: &str,
        compute: impl FnOnce() -> Vec<TokenId>,
    ) -> (Arc<PrefixEntry>, bool) {
        let key = prefix_key(segment);
        match self.get(&key) {
            Some(entry) => (entry, true),
            None => (self.insert(key, compute()), false),
        }
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_segment_same_key() {
        assert_eq!(prefix_key("You are a blacksmith."), prefix_key("You are a blacksmith."));
        assert_ne!(prefix_key("You are a blacksmith."), prefix_key("You are a baker."));
    }

    #[test]
    fn test_get_or_insert_computes_once() {
        let cache = SharedPrefixCache::new(4);
        let mut calls = 0;
        let (a, hit_a) = cache.get_or_insert_with("system", || {
            calls += 1;
            vec![1, 2, 3]
        });
        let (b, hit_b) = cache.get_or_insert_with("system", || {
            calls += 1;
            vec![9]
        });
        assert!(!hit_a);
        assert!(hit_b);
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_reader_snapshot_survives_write() {
        let cache = SharedPrefixCache::new(4);
        cache.insert(prefix_key("a"), vec![1]);
        let snapshot = cache.map();
        cache.insert(prefix_key("b"), vec![2]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_capacity_drops_least_hit() {
        let cache = SharedPrefixCache::new(2);
        cache.insert(prefix_key("hot"), vec![1]);
        cache.insert(prefix_key("cold"), vec![2]);
        cache.get(&prefix_key("hot"));

        cache.insert(prefix_key("new"), vec![3]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&prefix_key("hot")).is_some());
        assert!(cache.get(&prefix_key("cold")).is_none());
    }
}
