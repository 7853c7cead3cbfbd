//! Bronze tier: large model behind the async job manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::ServingError;
use crate::inference::engine::InferenceEngine;
use crate::inference::model::{detokenize, text_unit, tokenize, ModelFactory};
use crate::jobs::{JobExecutor, JobManager, JobOutcome, JobOutput};
use crate::registry::descriptor::TierId;
use crate::registry::TierRegistry;
use crate::router::envelope::{RequestEnvelope, ResponseSource};
use crate::tiers::client::{render_prompt, TierClient, TierOutput};

/// Runs Bronze generations for the job manager.
pub struct BronzeExecutor {
    registry: Arc<TierRegistry>,
    engine: InferenceEngine,
    max_tokens: usize,
    vocab_size: usize,
    time_limit: Duration,
}

impl BronzeExecutor {
    pub fn new(config: &Config, registry: Arc<TierRegistry>, factory: Arc<dyn ModelFactory>) -> Self {
        let tier = &config.tiers.bronze;
        Self {
            engine: InferenceEngine::new(
                TierId::Bronze,
                factory,
                &registry.model_ref(TierId::Bronze),
                tier.simulated_latency(),
            ),
            registry,
            max_tokens: tier.max_tokens,
            vocab_size: config.speculative.vocab_size,
            time_limit: config.jobs.max_wall_clock(),
        }
    }
}

#[async_trait]
impl JobExecutor for BronzeExecutor {
    async fn execute(&self, prompt: &str) -> anyhow::Result<JobOutput> {
        let tokens = tokenize(prompt, self.vocab_size);
        let generation = self
            .engine
            .generate(
                &self.registry.model_ref(TierId::Bronze),
                &tokens,
                self.max_tokens,
                rand::random(),
                Instant::now() + self.time_limit,
            )
            .await?;
        let content = detokenize(&generation.tokens);
        // Synthetic quality in [0.5, 1.0).
        let quality_score = 0.5 + 0.5 * text_unit(&content);
        Ok(JobOutput {
            content,
            quality_score,
        })
    }
}

pub struct BronzeClient {
    jobs: Arc<JobManager>,
}

impl BronzeClient {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }
}

#[async_trait]
impl TierClient for BronzeClient {
    fn tier(&self) -> TierId {
        TierId::Bronze
    }

    /// Submit the request as a job and wait for it until `deadline`. A job
    /// still running at the deadline is returned by id for the caller to poll.
    async fn infer(
        &self,
        request: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<TierOutput, ServingError> {
        let dedupe_key = format!("{}:{}", request.entity_id, request.id);
        let job_id = self.jobs.submit(render_prompt(&request.context), dedupe_key);

        let status = self.jobs.wait(&job_id, deadline).await?;
        if status.is_terminal() {
            // Failures surface here with retry guidance.
            if let JobOutcome::Succeeded(content) = self.jobs.retrieve(&job_id)? {
                let screened = self
                    .jobs
                    .poll(&job_id)
                    .is_some_and(|job| job.guardrail_rule.is_some());
                return Ok(TierOutput {
                    content,
                    source: if screened {
                        ResponseSource::Guardrail
                    } else {
                        ResponseSource::Model
                    },
                    job_id: Some(job_id),
                    adapter_version: None,
                });
            }
        }

        Ok(TierOutput {
            content: String::new(),
            source: ResponseSource::Job,
            job_id: Some(job_id),
            adapter_version: None,
        })
    }
}
