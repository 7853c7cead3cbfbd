//! KV cache management for the Gold and Silver tiers.
//!
//! - [`entry`]: CacheEntry and the token-window decode state encoding
//! - [`manager`]: per-entity cache with pinning and capacity-driven eviction
//! - [`evictor`]: LRU victim selection among unpinned entries
//! - [`prefix`]: shared, copy-on-write prefix cache keyed by system-prompt hash

pub mod entry;
pub mod evictor;
pub mod manager;
pub mod prefix;
