//! Gold tier: warm per-entity KV cache plus speculative decoding.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::manager::KvCacheManager;
use crate::config::Config;
use crate::error::ServingError;
use crate::inference::engine::InferenceEngine;
use crate::inference::model::{detokenize, ModelFactory, SyntheticModel, SyntheticModelFactory};
use crate::inference::speculative::SpeculativeDecoder;
use crate::metrics::Metrics;
use crate::registry::descriptor::TierId;
use crate::registry::TierRegistry;
use crate::router::envelope::RequestEnvelope;
use crate::tiers::client::{assemble_context, store_window, TierClient, TierOutput};

pub struct GoldClient {
    registry: Arc<TierRegistry>,
    engine: InferenceEngine,
    decoder: SpeculativeDecoder,
    cache: Arc<KvCacheManager>,
    max_tokens: usize,
    vocab_size: usize,
    context_window: usize,
}

impl GoldClient {
    pub fn new(
        config: &Config,
        registry: Arc<TierRegistry>,
        factory: Arc<dyn ModelFactory>,
        cache: Arc<KvCacheManager>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let tier = &config.tiers.gold;
        let spec = &config.speculative;

        // The draft is the base model with a perturbation, so it tracks the target closely.
        let draft = SyntheticModel::new(
            SyntheticModelFactory::base_seed(&tier.base_model),
            spec.vocab_size,
            spec.temperature,
        )
        .with_perturbation(0x5eed_d4af, spec.draft_perturbation);
        let mut decoder = SpeculativeDecoder::new(Arc::new(draft), spec);
        if let Some(m) = metrics {
            decoder = decoder.with_metrics(m);
        }

        Self {
            engine: InferenceEngine::new(
                TierId::Gold,
                factory,
                &registry.model_ref(TierId::Gold),
                tier.simulated_latency(),
            ),
            registry,
            decoder,
            cache,
            max_tokens: tier.max_tokens,
            vocab_size: spec.vocab_size,
            context_window: config.cache.context_window_tokens,
        }
    }

    pub fn decoder(&self) -> &SpeculativeDecoder {
        &self.decoder
    }

    pub fn cache(&self) -> &Arc<KvCacheManager> {
        &self.cache
    }
}

#[async_trait]
impl TierClient for GoldClient {
    fn tier(&self) -> TierId {
        TierId::Gold
    }

    async fn infer(
        &self,
        request: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<TierOutput, ServingError> {
        // One decode per entity; later requests for it queue here.
        let _turn = self.decoder.acquire(&request.entity_id, deadline).await?;
        let _pin = self.cache.pin(&request.entity_id);

        let loaded = self
            .engine
            .slot()
            .sync_to(&self.registry.model_ref(TierId::Gold));
        let (context, conversation) = assemble_context(&self.cache, request, self.vocab_size);

        let latency = self.engine.simulated_latency();
        if !latency.is_zero() {
            tokio::time::timeout_at(deadline, tokio::time::sleep(latency))
                .await
                .map_err(|_| ServingError::Timeout {
                    tier: Some(TierId::Gold),
                })?;
        }

        let mut rng = StdRng::seed_from_u64(rand::random());
        let out = self
            .decoder
            .generate(
                loaded.model.as_ref(),
                &context,
                self.max_tokens,
                &mut rng,
                deadline,
            )
            .await?;

        debug!(
            entity_id = request.entity_id,
            tokens = out.tokens.len(),
            acceptance = out.stats.acceptance_rate(),
            "Gold decode complete"
        );

        store_window(
            &self.cache,
            &request.entity_id,
            conversation,
            &out.tokens,
            self.context_window,
        );
        Ok(TierOutput::model(
            detokenize(&out.tokens),
            loaded.adapter.version,
        ))
    }

    fn is_warm(&self, entity_id: &str) -> bool {
        self.cache.contains(entity_id)
    }
}
