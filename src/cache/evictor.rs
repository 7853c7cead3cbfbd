//! Eviction policy: least-recently-used among unpinned entries.
//!
//! Candidates are scored by idle time; pinned entries never become candidates.

use std::collections::BinaryHeap;
use std::time::Instant;

use crate::cache::entry::EntityId;

/// What the evictor needs to know about an entry.
#[derive(Debug, Clone)]
pub struct EvictionView {
    pub entity_id: EntityId,
    pub last_used: Instant,
    pub pinned: bool,
    pub size: usize,
}

/// An eviction candidate with its computed priority score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub entity_id: EntityId,
    /// Seconds idle; higher = evicted first.
    pub score: f64,
    pub size: usize,
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[derive(Debug, Default)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Select the least-recently-used unpinned entries whose sizes add up to
    /// at least `bytes_to_free`.
    ///
    /// Returns candidates ordered oldest first. May free less than asked when
    /// too much of the cache is pinned.
    pub fn select_victims(
        &self,
        entries: impl IntoIterator<Item = EvictionView>,
        bytes_to_free: usize,
    ) -> Vec<EvictionCandidate> {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();

        for entry in entries {
            if entry.pinned {
                continue;
            }
            heap.push(EvictionCandidate {
                score: now.duration_since(entry.last_used).as_secs_f64(),
                entity_id: entry.entity_id,
                size: entry.size,
            });
        }

        let mut freed = 0;
        let mut victims = Vec::new();
        while freed < bytes_to_free {
            match heap.pop() {
                Some(candidate) => {
                    freed += candidate.size;
                    victims.push(candidate);
                }
                None => break,
            }
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn view(id: &str, age_ms: u64, pinned: bool, size: usize) -> EvictionView {
        EvictionView {
            entity_id: id.to_string(),
            last_used: Instant::now() - Duration::from_millis(age_ms),
            pinned,
            size,
        }
    }

    #[test]
    fn test_oldest_evicted_first() {
        let victims = Evictor::new().select_victims(
            vec![view("a", 10, false, 100), view("b", 500, false, 100), view("c", 50, false, 100)],
            150,
        );
        let ids: Vec<_> = victims.iter().map(|v| v.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_pinned_never_selected() {
        let victims = Evictor::new().select_victims(
            vec![view("old", 10_000, true, 100), view("new", 1, false, 100)],
            1000,
        );
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].entity_id, "new");
    }
}
