//! Silver tier: mid-size model with a KV cache and the state predictor in front.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::manager::KvCacheManager;
use crate::config::Config;
use crate::error::ServingError;
use crate::inference::engine::InferenceEngine;
use crate::inference::model::{detokenize, tokenize, ModelFactory};
use crate::predictor::{Precompute, StatePredictor};
use crate::registry::descriptor::TierId;
use crate::registry::TierRegistry;
use crate::router::envelope::{GenerationContext, RequestEnvelope, ResponseSource};
use crate::tiers::client::{assemble_context, render_prompt, store_window, TierClient, TierOutput};

/// Silver's model and decode settings, shared by live requests and the
/// predictor's precomputation.
pub struct SilverGenerator {
    registry: Arc<TierRegistry>,
    engine: InferenceEngine,
    max_tokens: usize,
    vocab_size: usize,
}

impl SilverGenerator {
    pub fn new(config: &Config, registry: Arc<TierRegistry>, factory: Arc<dyn ModelFactory>) -> Self {
        let tier = &config.tiers.silver;
        Self {
            engine: InferenceEngine::new(
                TierId::Silver,
                factory,
                &registry.model_ref(TierId::Silver),
                tier.simulated_latency(),
            ),
            registry,
            max_tokens: tier.max_tokens,
            vocab_size: config.speculative.vocab_size,
        }
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }
}

#[async_trait]
impl Precompute for SilverGenerator {
    async fn precompute(&self, _entity_id: &str, context: &GenerationContext) -> anyhow::Result<String> {
        let tokens = tokenize(&render_prompt(context), self.vocab_size);
        let deadline = Instant::now() + self.engine.simulated_latency() * 10;
        let generation = self
            .engine
            .generate(
                &self.registry.model_ref(TierId::Silver),
                &tokens,
                self.max_tokens,
                rand::random(),
                deadline,
            )
            .await?;
        Ok(detokenize(&generation.tokens))
    }
}

pub struct SilverClient {
    generator: Arc<SilverGenerator>,
    cache: Arc<KvCacheManager>,
    predictor: Option<Arc<StatePredictor>>,
    context_window: usize,
}

impl SilverClient {
    pub fn new(
        config: &Config,
        generator: Arc<SilverGenerator>,
        cache: Arc<KvCacheManager>,
        predictor: Option<Arc<StatePredictor>>,
    ) -> Self {
        Self {
            generator,
            cache,
            predictor,
            context_window: config.cache.context_window_tokens,
        }
    }

    pub fn cache(&self) -> &Arc<KvCacheManager> {
        &self.cache
    }
}

#[async_trait]
impl TierClient for SilverClient {
    fn tier(&self) -> TierId {
        TierId::Silver
    }

    async fn infer(
        &self,
        request: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<TierOutput, ServingError> {
        if let Some(predictor) = &self.predictor {
            if let Some(record) = predictor.take_match(&request.entity_id, &request.context) {
                predictor.observe(&request.entity_id, &request.context, &record.response);
                return Ok(TierOutput {
                    content: record.response,
                    source: ResponseSource::Prediction,
                    job_id: None,
                    adapter_version: None,
                });
            }
        }

        let _pin = self.cache.pin(&request.entity_id);
        let generator = &self.generator;
        let (context, conversation) = assemble_context(&self.cache, request, generator.vocab_size);
        let generation = generator
            .engine
            .generate(
                &generator.registry.model_ref(TierId::Silver),
                &context,
                generator.max_tokens,
                rand::random(),
                deadline,
            )
            .await?;

        store_window(
            &self.cache,
            &request.entity_id,
            conversation,
            &generation.tokens,
            self.context_window,
        );
        let content = detokenize(&generation.tokens);
        if let Some(predictor) = &self.predictor {
            predictor.observe(&request.entity_id, &request.context, &content);
        }
        Ok(TierOutput::model(content, generation.adapter_version))
    }

    fn is_warm(&self, entity_id: &str) -> bool {
        self.cache.contains(entity_id)
    }
}
