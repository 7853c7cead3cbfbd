//! Per-entity cache entries.
//!
//! An entry holds the opaque decode state of one NPC's ongoing conversation.
//! The synthetic backends encode that state as the retained token window.

use std::time::Instant;

use bytes::{Bytes, BytesMut, BufMut};

use crate::inference::model::TokenId;

/// Identifies the NPC or session owning a conversation.
pub type EntityId = String;

/// A single per-entity KV cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub entity_id: EntityId,

    /// Opaque decode state.
    pub kv_blocks: Bytes,

    /// Timestamp of last access.
    pub last_used: Instant,

    /// Pinned entries are mid-decode and never evicted.
    pub pinned: bool,

    /// Size of `kv_blocks` in bytes.
    pub size: usize,
}

impl CacheEntry {
    pub fn new(entity_id: EntityId, kv_blocks: Bytes) -> Self {
        let size = kv_blocks.len();
        Self {
            entity_id,
            kv_blocks,
            last_used: Instant::now(),
            pinned: false,
            size,
        }
    }

    /// Record an access.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Replace the decode state, returning the size delta in bytes.
    pub fn replace(&mut self, kv_blocks: Bytes) -> isize {
        let delta = kv_blocks.len() as isize - self.size as isize;
        self.size = kv_blocks.len();
        self.kv_blocks = kv_blocks;
        self.touch();
        delta
    }
}

/// Encode a token window as decode state (little-endian u32s).
pub fn encode_tokens(tokens: &[TokenId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(tokens.len() * 4);
    for &t in tokens {
        buf.put_u32_le(t);
    }
    buf.freeze()
}

/// Decode a token window; trailing partial words are ignored.
pub fn decode_tokens(kv_blocks: &[u8]) -> Vec<TokenId> {
    kv_blocks
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
