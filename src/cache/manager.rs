//! KV cache manager: per-entity decode state plus the shared prefix cache.
//!
//! Each entity's entry sits behind its own lock, so unrelated entities never
//! serialize on each other. Aggregate size is tracked atomically; once it
//! exceeds capacity the least-recently-used unpinned entries are evicted.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::entry::{CacheEntry, EntityId};
use crate::cache::evictor::{EvictionView, Evictor};
use crate::cache::prefix::SharedPrefixCache;
use crate::config::CacheConfig;
use crate::metrics::Metrics;

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    pins: u32,
    /// Set when the slot has been evicted; writers holding a stale handle retry.
    detached: bool,
}

type SlotHandle = Arc<Mutex<Slot>>;

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes_used: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub prefix_entries: usize,
}

pub struct KvCacheManager {
    name: String,
    entries: DashMap<EntityId, SlotHandle>,
    total_bytes: AtomicUsize,
    capacity: usize,
    evictor: Evictor,
    prefix: SharedPrefixCache,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl KvCacheManager {
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            total_bytes: AtomicUsize::new(0),
            capacity: config.capacity_bytes,
            evictor: Evictor::new(),
            prefix: SharedPrefixCache::new(config.prefix_capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn prefix_cache(&self) -> &SharedPrefixCache {
        &self.prefix
    }

    fn slot(&self, entity_id: &str) -> Option<SlotHandle> {
        self.entries.get(entity_id).map(|s| Arc::clone(s.value()))
    }

    fn slot_or_insert(&self, entity_id: &str) -> SlotHandle {
        if let Some(slot) = self.slot(entity_id) {
            return slot;
        }
        Arc::clone(
            self.entries
                .entry(entity_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Slot {
                        entry: CacheEntry::new(entity_id.to_string(), Bytes::new()),
                        pins: 0,
                        detached: false,
                    }))
                })
                .value(),
        )
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.cache_lookups
                .with_label_values(&[self.name.as_str(), if hit { "hit" } else { "miss" }])
                .inc();
        }
    }

    /// Look up an entity's decode state. Empty placeholder entries count as misses.
    pub fn get(&self, entity_id: &str) -> Option<CacheEntry> {
        let found = self.slot(entity_id).and_then(|slot| {
            let mut slot = slot.lock();
            if slot.detached || slot.entry.size == 0 {
                return None;
            }
            slot.entry.touch();
            Some(slot.entry.clone())
        });
        self.record_lookup(found.is_some());
        found
    }

    /// Whether an entity has warm decode state, without counting a lookup.
    pub fn contains(&self, entity_id: &str) -> bool {
        self.slot(entity_id)
            .map(|slot| {
                let slot = slot.lock();
                !slot.detached && slot.entry.size > 0
            })
            .unwrap_or(false)
    }

    /// Store an entity's decode state, evicting LRU entries if over capacity.
    pub fn put(&self, entity_id: &str, kv_blocks: Bytes) {
        loop {
            let handle = self.slot_or_insert(entity_id);
            let mut slot = handle.lock();
            // A detached slot was evicted between lookup and lock; retry on a fresh one.
            if !slot.detached {
                // Accounting happens under the slot lock so a concurrent eviction
                // never subtracts a size that has not been added yet.
                let delta = slot.entry.replace(kv_blocks);
                if delta >= 0 {
                    self.total_bytes.fetch_add(delta as usize, Ordering::AcqRel);
                } else {
                    self.total_bytes
                        .fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
                }
                break;
            }
        }

        if self.bytes_used() > self.capacity {
            self.evict_to_capacity();
        }
    }

    fn acquire_pin(&self, entity_id: &str) -> SlotHandle {
        loop {
            let handle = self.slot_or_insert(entity_id);
            {
                let mut slot = handle.lock();
                if slot.detached {
                    continue;
                }
                slot.pins += 1;
                slot.entry.pinned = true;
            }
            return handle;
        }
    }

    /// Pin an entity's entry (creating an empty one if needed) until the guard drops.
    pub fn pin(&self, entity_id: &str) -> PinGuard {
        PinGuard {
            slot: self.acquire_pin(entity_id),
        }
    }

    /// Release one pin taken without a guard. Returns false if the entity is not pinned.
    pub fn unpin(&self, entity_id: &str) -> bool {
        match self.slot(entity_id) {
            Some(slot) => release_pin(&slot),
            None => false,
        }
    }

    /// Pin without a guard; pair with [`KvCacheManager::unpin`].
    pub fn pin_manual(&self, entity_id: &str) {
        self.acquire_pin(entity_id);
    }

    /// Drop an entity's state (e.g. the conversation ended). Pinned entries stay.
    pub fn remove(&self, entity_id: &str) -> bool {
        self.detach_if_unpinned(entity_id)
    }

    fn detach_if_unpinned(&self, entity_id: &str) -> bool {
        let mut freed = 0;
        let removed = self.entries.remove_if(entity_id, |_, slot| match slot.try_lock() {
            Some(mut slot) if slot.pins == 0 => {
                slot.detached = true;
                freed = slot.entry.size;
                true
            }
            _ => false,
        });
        if removed.is_some() {
            self.total_bytes.fetch_sub(freed, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Evict least-recently-used unpinned entries until size is within capacity.
    ///
    /// Returns the number of entries evicted.
    pub fn evict_to_capacity(&self) -> usize {
        let excess = self.bytes_used().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }

        // Entries locked by another caller are in use and skipped this round.
        let views: Vec<EvictionView> = self
            .entries
            .iter()
            .filter_map(|item| {
                let slot = item.value().try_lock()?;
                Some(EvictionView {
                    entity_id: item.key().clone(),
                    last_used: slot.entry.last_used,
                    pinned: slot.pins > 0,
                    size: slot.entry.size,
                })
            })
            .collect();

        let victims = self.evictor.select_victims(views, excess);

        let mut evicted = 0;
        for victim in victims {
            if self.detach_if_unpinned(&victim.entity_id) {
                evicted += 1;
                debug!(
                    cache = self.name,
                    entity_id = victim.entity_id,
                    size = victim.size,
                    "Evicted entry"
                );
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.cache_evictions.inc_by(evicted as u64);
            }
            info!(
                cache = self.name,
                evicted,
                bytes_used = self.bytes_used(),
                capacity = self.capacity,
                "Eviction round complete"
            );
        }
        evicted
    }

    pub fn bytes_used(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_pinned(&self, entity_id: &str) -> bool {
        self.slot(entity_id)
            .map(|slot| slot.lock().pins > 0)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let bytes_used = self.bytes_used();
        CacheStats {
            entries: self.len(),
            bytes_used,
            capacity: self.capacity,
            utilization: if self.capacity == 0 {
                0.0
            } else {
                bytes_used as f64 / self.capacity as f64
            },
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            prefix_entries: self.prefix.len(),
        }
    }
}

fn release_pin(slot: &SlotHandle) -> bool {
    let mut slot = slot.lock();
    if slot.pins == 0 {
        return false;
    }
    slot.pins -= 1;
    slot.entry.pinned = slot.pins > 0;
    true
}

/// Keeps an entity's entry pinned; unpins on drop, including on cancellation.
#[derive(Debug)]
pub struct PinGuard {
    slot: SlotHandle,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        release_pin(&self.slot);
    }
}
