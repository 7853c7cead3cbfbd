//! Adapters and their deployment history.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::events::unix_millis;
use crate::inference::model::TokenId;
use crate::registry::descriptor::{AdapterRef, TierId};

/// Smoothed unigram profile learned from traces; the synthetic adapter payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenProfile {
    pub counts: HashMap<TokenId, u64>,
    pub total: u64,
}

impl TokenProfile {
    pub fn add(&mut self, tokens: &[TokenId]) {
        for &t in tokens {
            *self.counts.entry(t).or_insert(0) += 1;
        }
        self.total += tokens.len() as u64;
    }

    /// Add-one smoothed probability of `token` over a vocabulary of `vocab_size`.
    pub fn probability(&self, token: TokenId, vocab_size: usize) -> f64 {
        let count = self.counts.get(&token).copied().unwrap_or(0);
        (count as f64 + 1.0) / (self.total as f64 + vocab_size as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Adapter {
    pub id: String,
    pub base_model: String,
    pub version: u64,
    pub target: TierId,
    /// Sequence numbers of the traces it was trained on.
    pub trained_from_traces: Vec<u64>,
    pub validation_score: f64,
    pub deployed_at: Option<u64>,
    #[serde(skip)]
    pub profile: Arc<TokenProfile>,
}

impl Adapter {
    pub fn descriptor(&self) -> AdapterRef {
        AdapterRef {
            id: self.id.clone(),
            base_model: self.base_model.clone(),
            version: self.version,
            validation_score: self.validation_score,
        }
    }
}

#[derive(Debug, Default)]
struct TierHistory {
    /// Deployed adapters, most recent last. The last one is live.
    deployed: Vec<Adapter>,
    /// Rolled back or rejected; kept for inspection.
    retired: Vec<Adapter>,
    last_version: u64,
}

/// Per-tier adapter history. Superseded adapters are retained for rollback.
#[derive(Default)]
pub struct AdapterStore {
    tiers: RwLock<HashMap<TierId, TierHistory>>,
}

impl AdapterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused version for a tier. Version 0 is the base model.
    pub fn next_version(&self, tier: TierId) -> u64 {
        let mut tiers = self.tiers.write();
        let history = tiers.entry(tier).or_default();
        history.last_version += 1;
        history.last_version
    }

    /// The live adapter, or `None` while the base model is deployed.
    pub fn active(&self, tier: TierId) -> Option<Adapter> {
        self.tiers
            .read()
            .get(&tier)
            .and_then(|h| h.deployed.last().cloned())
    }

    pub fn record_deployed(&self, mut adapter: Adapter) {
        adapter.deployed_at = Some(unix_millis());
        self.tiers
            .write()
            .entry(adapter.target)
            .or_default()
            .deployed
            .push(adapter);
    }

    pub fn record_rejected(&self, adapter: Adapter) {
        self.tiers
            .write()
            .entry(adapter.target)
            .or_default()
            .retired
            .push(adapter);
    }

    /// Retire the live adapter. Returns it and the one now live (`None` = base model).
    pub fn roll_back(&self, tier: TierId) -> Option<(Adapter, Option<Adapter>)> {
        let mut tiers = self.tiers.write();
        let history = tiers.get_mut(&tier)?;
        let retired = history.deployed.pop()?;
        history.retired.push(retired.clone());
        Some((retired, history.deployed.last().cloned()))
    }

    /// Undo [`AdapterStore::roll_back`] when the registry swap did not happen.
    pub fn restore(&self, tier: TierId) {
        let mut tiers = self.tiers.write();
        if let Some(history) = tiers.get_mut(&tier) {
            if let Some(adapter) = history.retired.pop() {
                history.deployed.push(adapter);
            }
        }
    }

    pub fn history(&self, tier: TierId) -> Vec<Adapter> {
        self.tiers
            .read()
            .get(&tier)
            .map(|h| h.deployed.clone())
            .unwrap_or_default()
    }

    pub fn retired(&self, tier: TierId) -> Vec<Adapter> {
        self.tiers
            .read()
            .get(&tier)
            .map(|h| h.retired.clone())
            .unwrap_or_default()
    }
}
