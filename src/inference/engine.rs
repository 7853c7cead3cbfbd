//! Per-tier inference engine.
//!
//! The engine owns a [`ModelSlot`] that tracks the adapter deployed in the
//! tier registry and drives plain (target-only) decoding. Gold layers the
//! speculative decoder on top of the same slot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ServingError;
use crate::inference::model::{sample, ModelFactory, TokenId, TokenModel};
use crate::registry::descriptor::{AdapterRef, TierId};

/// A model together with the adapter it was loaded from.
pub struct LoadedModel {
    pub adapter: AdapterRef,
    pub model: Arc<dyn TokenModel>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

/// Holds the currently loaded model for one tier and reloads it when the
/// registry's adapter changes.
///
/// Requests clone the `Arc<LoadedModel>` they start with, so a swap never
/// affects a decode already in flight. While one caller loads a new adapter,
/// everyone else keeps using the prior one.
pub struct ModelSlot {
    tier: TierId,
    factory: Arc<dyn ModelFactory>,
    current: RwLock<Arc<LoadedModel>>,
    reload_gate: Mutex<()>,
}

impl ModelSlot {
    pub fn new(tier: TierId, factory: Arc<dyn ModelFactory>, initial: &AdapterRef) -> Self {
        let model = factory.load(initial);
        Self {
            tier,
            factory,
            current: RwLock::new(Arc::new(LoadedModel {
                adapter: initial.clone(),
                model,
            })),
            reload_gate: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<LoadedModel> {
        Arc::clone(&self.current.read())
    }

    pub fn loaded_version(&self) -> u64 {
        self.current.read().adapter.version
    }

    /// Return the model for `wanted`, loading it first if it differs from the
    /// loaded adapter. Returns the prior model if another caller is mid-load.
    pub fn sync_to(&self, wanted: &AdapterRef) -> Arc<LoadedModel> {
        let current = self.current();
        if current.adapter.version == wanted.version && current.adapter.id == wanted.id {
            return current;
        }

        let Some(_gate) = self.reload_gate.try_lock() else {
            debug!(tier = %self.tier, "Adapter reload in progress, serving prior adapter");
            return current;
        };

        // Another caller may have finished the load while we waited.
        let current = self.current();
        if current.adapter.version == wanted.version && current.adapter.id == wanted.id {
            return current;
        }

        let loaded = Arc::new(LoadedModel {
            adapter: wanted.clone(),
            model: self.factory.load(wanted),
        });
        *self.current.write() = Arc::clone(&loaded);
        info!(
            tier = %self.tier,
            adapter = wanted.id,
            from_version = current.adapter.version,
            to_version = wanted.version,
            "Adapter reloaded"
        );
        loaded
    }
}

/// Output of one decode.
#[derive(Debug, Clone)]
pub struct Generation {
    pub tokens: Vec<TokenId>,
    pub adapter_version: u64,
}

/// Target-only decoding with a simulated per-request backend latency.
pub struct InferenceEngine {
    tier: TierId,
    slot: ModelSlot,
    simulated_latency: Duration,
}

impl InferenceEngine {
    pub fn new(
        tier: TierId,
        factory: Arc<dyn ModelFactory>,
        initial: &AdapterRef,
        simulated_latency: Duration,
    ) -> Self {
        Self {
            tier,
            slot: ModelSlot::new(tier, factory, initial),
            simulated_latency,
        }
    }

    pub fn tier(&self) -> TierId {
        self.tier
    }

    pub fn slot(&self) -> &ModelSlot {
        &self.slot
    }

    pub fn simulated_latency(&self) -> Duration {
        self.simulated_latency
    }

    /// Decode up to `max_tokens` with the adapter `wanted`, giving up at `deadline`.
    pub async fn generate(
        &self,
        wanted: &AdapterRef,
        context: &[TokenId],
        max_tokens: usize,
        seed: u64,
        deadline: Instant,
    ) -> Result<Generation, ServingError> {
        let loaded = self.slot.sync_to(wanted);
        let timeout = ServingError::Timeout {
            tier: Some(self.tier),
        };

        if !self.simulated_latency.is_zero() {
            tokio::time::timeout_at(deadline, tokio::time::sleep(self.simulated_latency))
                .await
                .map_err(|_| timeout.clone())?;
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut ctx = context.to_vec();
        let mut tokens = Vec::with_capacity(max_tokens);
        for _ in 0..max_tokens {
            if Instant::now() >= deadline {
                return Err(timeout);
            }
            let next = sample(&loaded.model.next_distribution(&ctx), &mut rng);
            ctx.push(next);
            tokens.push(next);
            tokio::task::yield_now().await;
        }

        Ok(Generation {
            tokens,
            adapter_version: loaded.adapter.version,
        })
    }
}

/// Plain autoregressive decoding from the target model; the reference
/// distribution speculative decoding must reproduce.
pub fn decode_target_only(
    model: &dyn TokenModel,
    context: &[TokenId],
    max_tokens: usize,
    rng: &mut StdRng,
) -> Vec<TokenId> {
    let mut ctx = context.to_vec();
    let mut out = Vec::with_capacity(max_tokens);
    for _ in 0..max_tokens {
        let next = sample(&model.next_distribution(&ctx), rng);
        ctx.push(next);
        out.push(next);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::inference::model::SyntheticModelFactory;

    struct CountingFactory {
        inner: SyntheticModelFactory,
        loads: AtomicUsize,
    }

    impl ModelFactory for CountingFactory {
        fn load(&self, adapter: &AdapterRef) -> Arc<dyn TokenModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(adapter)
        }
    }

    fn tuned(version: u64) -> AdapterRef {
        AdapterRef {
            id: format!("adapter-v{version}"),
            base_model: "npc-small".into(),
            version,
            validation_score: 0.9,
        }
    }

    #[test]
    fn test_slot_reloads_only_on_version_change() {
        let factory = Arc::new(CountingFactory {
            inner: SyntheticModelFactory::new(32, 1.0),
            loads: AtomicUsize::new(0),
        });
        let base = AdapterRef::baseline("npc-small");
        let slot = ModelSlot::new(TierId::Gold, factory.clone(), &base);
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);

        let in_flight = slot.sync_to(&base);
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);

        let next = slot.sync_to(&tuned(1));
        assert_eq!(factory.loads.load(Ordering::SeqCst), 2);
        assert_eq!(slot.loaded_version(), 1);
        assert_eq!(next.adapter.version, 1);
        // The request that started before the swap still holds the old model.
        assert_eq!(in_flight.adapter.version, 0);
    }

    #[tokio::test]
    async fn test_generate_respects_deadline() {
        let engine = InferenceEngine::new(
            TierId::Silver,
            Arc::new(SyntheticModelFactory::new(32, 1.0)),
            &AdapterRef::baseline("npc-medium"),
            Duration::from_millis(50),
        );
        let deadline = Instant::now() + Duration::from_millis(5);
        let err = engine
            .generate(&AdapterRef::baseline("npc-medium"), &[1, 2], 8, 7, deadline)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ServingError::Timeout {
                tier: Some(TierId::Silver)
            }
        );
    }

    #[tokio::test]
    async fn test_generate_matches_target_only() {
        let factory = Arc::new(SyntheticModelFactory::new(32, 1.0));
        let base = AdapterRef::baseline("npc-medium");
        let engine = InferenceEngine::new(TierId::Silver, factory.clone(), &base, Duration::ZERO);
        let out = engine
            .generate(&base, &[3], 6, 11, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let model = factory.build(&base);
        let expected = decode_target_only(&model, &[3], 6, &mut StdRng::seed_from_u64(11));
        assert_eq!(out.tokens, expected);
    }
}
