//! Speculative decoding for the Gold tier.
//!
//! A small draft model proposes `K` tokens; the target model scores all of
//! them in one batched pass. Each drafted token `x` is accepted with
//! probability `min(1, p(x) / q(x))`. On the first rejection the token is
//! resampled from the normalized residual `max(0, p - q)` and the round ends.
//! If all `K` are accepted a bonus token is drawn from the target's next
//! distribution. The emitted sequence has exactly the target model's
//! distribution.
//!
//! Only one decode runs per entity at a time; later callers queue on a
//! per-entity async lock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::config::SpeculativeConfig;
use crate::error::ServingError;
use crate::inference::model::{sample, TokenId, TokenModel};
use crate::metrics::Metrics;
use crate::registry::descriptor::TierId;

/// Per-entity async locks. Entries are dropped once nobody holds or waits on them.
#[derive(Default)]
pub struct EntityLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this entity's turn. Cancelling the returned future gives up the place in line.
    pub async fn acquire(&self, entity_id: &str) -> EntityTurn<'_> {
        let lock = Arc::clone(self.locks.entry(entity_id.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        EntityTurn {
            locks: self,
            entity_id: entity_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Whether a decode currently holds this entity's turn.
    pub fn is_busy(&self, entity_id: &str) -> bool {
        self.locks
            .get(entity_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop entries left behind by waiters that were cancelled.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive decode turn for one entity; released on drop.
pub struct EntityTurn<'a> {
    locks: &'a EntityLocks,
    entity_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still references the lock: nobody is queued behind us.
        self.locks
            .locks
            .remove_if(&self.entity_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Counters from one or more decodes.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DecodeStats {
    pub proposed: usize,
    pub accepted: usize,
    pub target_passes: usize,
    pub draft_steps: usize,
    pub emitted: usize,
}

impl DecodeStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    /// Tokens per unit of target-model cost, relative to one token per target pass.
    pub fn speedup(&self, draft_cost_ratio: f64) -> f64 {
        let cost = self.target_passes as f64 + draft_cost_ratio * self.draft_steps as f64;
        if cost == 0.0 {
            1.0
        } else {
            self.emitted as f64 / cost
        }
    }

    fn absorb(&mut self, other: &DecodeStats) {
        self.proposed += other.proposed;
        self.accepted += other.accepted;
        self.target_passes += other.target_passes;
        self.draft_steps += other.draft_steps;
        self.emitted += other.emitted;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeculativeReport {
    pub decodes: u64,
    pub acceptance_rate: f64,
    pub speedup: f64,
    pub totals: DecodeStats,
}

#[derive(Debug, Clone)]
pub struct DecodeOutput {
    pub tokens: Vec<TokenId>,
    pub stats: DecodeStats,
}

/// One speculative round: propose `k` draft tokens, verify them against the
/// target and return the emitted tokens (between 1 and `k + 1`).
pub fn speculative_round(
    draft: &dyn TokenModel,
    target: &dyn TokenModel,
    context: &[TokenId],
    k: usize,
    rng: &mut StdRng,
) -> (Vec<TokenId>, DecodeStats) {
    let mut stats = DecodeStats::default();
    let mut ctx = context.to_vec();
    let mut drafted = Vec::with_capacity(k);
    let mut draft_dists = Vec::with_capacity(k);

    for _ in 0..k {
        let q = draft.next_distribution(&ctx);
        let token = sample(&q, rng);
        ctx.push(token);
        drafted.push(token);
        draft_dists.push(q);
        stats.draft_steps += 1;
    }

    let target_dists = target.score_continuations(context, &drafted);
    stats.target_passes += 1;
    stats.proposed += k;

    let mut emitted = Vec::with_capacity(k + 1);
    for (i, &token) in drafted.iter().enumerate() {
        let p = &target_dists[i];
        let q = &draft_dists[i];
        let x = token as usize;
        let accept = q[x] > 0.0 && rng.gen::<f64>() < (p[x] / q[x]).min(1.0);
        if accept {
            emitted.push(token);
            stats.accepted += 1;
            continue;
        }

        let residual: Vec<f64> = p.iter().zip(q).map(|(pi, qi)| (pi - qi).max(0.0)).collect();
        let next = if residual.iter().sum::<f64>() > 0.0 {
            sample(&residual, rng)
        } else {
            sample(p, rng)
        };
        emitted.push(next);
        stats.emitted += emitted.len();
        return (emitted, stats);
    }

    emitted.push(sample(&target_dists[k], rng));
    stats.emitted += emitted.len();
    (emitted, stats)
}

pub struct SpeculativeDecoder {
    draft: Arc<dyn TokenModel>,
    lookahead: usize,
    draft_cost_ratio: f64,
    locks: EntityLocks,
    totals: Mutex<(u64, DecodeStats)>,
    metrics: Option<Arc<Metrics>>,
}

impl SpeculativeDecoder {
    pub fn new(draft: Arc<dyn TokenModel>, config: &SpeculativeConfig) -> Self {
        Self {
            draft,
            lookahead: config.lookahead.max(1),
            draft_cost_ratio: config.draft_cost_ratio,
            locks: EntityLocks::new(),
            totals: Mutex::new((0, DecodeStats::default())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Wait for `entity_id`'s decode turn, giving up at `deadline`.
    pub async fn acquire(
        &self,
        entity_id: &str,
        deadline: Instant,
    ) -> Result<EntityTurn<'_>, ServingError> {
        tokio::time::timeout_at(deadline, self.locks.acquire(entity_id))
            .await
            .map_err(|_| ServingError::Timeout {
                tier: Some(TierId::Gold),
            })
    }

    /// Serialized decode for one entity.
    pub async fn decode(
        &self,
        entity_id: &str,
        target: &dyn TokenModel,
        prompt: &[TokenId],
        max_tokens: usize,
        rng: &mut StdRng,
        deadline: Instant,
    ) -> Result<DecodeOutput, ServingError> {
        let _turn = self.acquire(entity_id, deadline).await?;
        self.generate(target, prompt, max_tokens, rng, deadline).await
    }

    /// Speculative decode without taking the entity lock; the caller holds the turn.
    pub async fn generate(
        &self,
        target: &dyn TokenModel,
        prompt: &[TokenId],
        max_tokens: usize,
        rng: &mut StdRng,
        deadline: Instant,
    ) -> Result<DecodeOutput, ServingError> {
        let mut ctx = prompt.to_vec();
        let mut tokens = Vec::with_capacity(max_tokens);
        let mut stats = DecodeStats::default();

        while tokens.len() < max_tokens {
            if Instant::now() >= deadline {
                return Err(ServingError::Timeout {
                    tier: Some(TierId::Gold),
                });
            }
            let k = self.lookahead.min(max_tokens - tokens.len());
            let (emitted, round) = speculative_round(self.draft.as_ref(), target, &ctx, k, rng);
            stats.absorb(&round);

            let room = max_tokens - tokens.len();
            let take = emitted.len().min(room);
            ctx.extend_from_slice(&emitted[..take]);
            tokens.extend_from_slice(&emitted[..take]);
            tokio::task::yield_now().await;
        }
        stats.emitted = tokens.len();

        self.record(&stats);
        Ok(DecodeOutput { tokens, stats })
    }

    fn record(&self, stats: &DecodeStats) {
        {
            let mut totals = self.totals.lock();
            totals.0 += 1;
            totals.1.absorb(stats);
        }
        if let Some(m) = &self.metrics {
            m.speculative_acceptance.observe(stats.acceptance_rate());
            m.speculative_speedup
                .observe(stats.speedup(self.draft_cost_ratio));
        }
    }

    pub fn report(&self) -> SpeculativeReport {
        let (decodes, totals) = *self.totals.lock();
        SpeculativeReport {
            decodes,
            acceptance_rate: totals.acceptance_rate(),
            speedup: totals.speedup(self.draft_cost_ratio),
            totals,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;

    use super::*;
    use crate::inference::model::SyntheticModel;

    fn pair() -> (SyntheticModel, SyntheticModel) {
        let target = SyntheticModel::new(42, 64, 0.8);
        let draft = SyntheticModel::new(42, 64, 0.8).with_perturbation(7, 0.3);
        (target, draft)
    }

    #[test]
    fn test_round_emits_between_one_and_k_plus_one() {
        let (target, draft) = pair();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let (emitted, stats) = speculative_round(&draft, &target, &[1, 2], 4, &mut rng);
            assert!((1..=5).contains(&emitted.len()));
            assert_eq!(stats.emitted, emitted.len());
            assert_eq!(stats.target_passes, 1);
        }
    }

    #[test]
    fn test_identical_draft_accepts_everything() {
        let target = SyntheticModel::new(5, 32, 1.0);
        let mut rng = StdRng::seed_from_u64(9);
        let (emitted, stats) = speculative_round(&target.clone(), &target, &[4], 4, &mut rng);
        assert_eq!(emitted.len(), 5);
        assert_eq!(stats.accepted, 4);
    }

    #[test]
    fn test_stats_speedup() {
        let stats = DecodeStats {
            proposed: 8,
            accepted: 6,
            target_passes: 2,
            draft_steps: 8,
            emitted: 8,
        };
        assert!((stats.acceptance_rate() - 0.75).abs() < 1e-9);
        assert!((stats.speedup(0.1) - 8.0 / 2.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_decode_emits_exact_count() {
        let (target, draft) = pair();
        let decoder = SpeculativeDecoder::new(Arc::new(draft), &SpeculativeConfig::default());
        let mut rng = StdRng::seed_from_u64(1);
        let out = decoder
            .decode(
                "npc-1",
                &target,
                &[1],
                10,
                &mut rng,
                Instant::now() + Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(out.tokens.len(), 10);
        assert_eq!(decoder.report().decodes, 1);
        assert!(decoder.locks().is_empty());
    }

    #[tokio::test]
    async fn test_turn_is_exclusive_per_entity() {
        let locks = EntityLocks::new();
        let turn = locks.acquire("npc-1").await;
        assert!(locks.is_busy("npc-1"));
        assert!(!locks.is_busy("npc-2"));

        let queued = tokio::time::timeout(Duration::from_millis(20), locks.acquire("npc-1")).await;
        assert!(queued.is_err());

        drop(turn);
        locks.prune();
        assert!(!locks.is_busy("npc-1"));
        assert!(locks.is_empty());
    }
}
