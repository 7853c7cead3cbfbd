//! Nightly distillation pipeline.
//!
//! One run:
//! 1. Collect traces appended since the last run, keeping those at or above
//!    the quality threshold.
//! 2. Split off a holdout set and train a candidate adapter per target tier.
//! 3. Score the candidate on the holdout set plus a regression suite replaying
//!    recent production prompts.
//! 4. Reject it if it scores worse than the deployed adapter by more than
//!    epsilon; otherwise compare-and-swap it into the registry.
//!
//! Tier clients pick up the new `model_ref` on their next request. A
//! post-deployment quality regression rolls the tier back automatically.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DistillationConfig;
use crate::distill::adapter::{Adapter, AdapterStore, TokenProfile};
use crate::distill::monitor::{QualityMonitor, QualitySample, Verdict, WatchStatus};
use crate::distill::trace::{ArchiveError, DistillationTrace, TraceArchive, TraceStore};
use crate::error::ServingError;
use crate::events::{unix_millis, EventKind};
use crate::inference::model::{text_unit, tokenize};
use crate::metrics::Metrics;
use crate::registry::descriptor::{AdapterRef, TierId};
use crate::registry::{RegistryError, TierRegistry};
use crate::router::recorder::DecisionLog;

#[derive(Error, Debug)]
pub enum DistillationError {
    #[error("A distillation run is already in progress")]
    AlreadyRunning,

    #[error("Training failed for tier {tier}: {message}")]
    Training { tier: TierId, message: String },

    #[error("No previously deployed adapter to roll back to on tier {0}")]
    NothingToRollBack(TierId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Builds an adapter from training traces.
pub trait Trainer: Send + Sync {
    fn train(
        &self,
        target: TierId,
        base: &AdapterRef,
        traces: &[DistillationTrace],
    ) -> anyhow::Result<TokenProfile>;
}

/// Scores an adapter in [0, 1] against held-out traces and replayed prompts.
pub trait Validator: Send + Sync {
    fn evaluate(
        &self,
        profile: &TokenProfile,
        holdout: &[DistillationTrace],
        regression: &[String],
    ) -> f64;
}

/// Learns a unigram profile over trace prompts and responses.
pub struct TraceStatsTrainer {
    pub vocab_size: usize,
}

impl Trainer for TraceStatsTrainer {
    fn train(
        &self,
        _target: TierId,
        _base: &AdapterRef,
        traces: &[DistillationTrace],
    ) -> anyhow::Result<TokenProfile> {
        if traces.is_empty() {
            anyhow::bail!("no training traces");
        }
        let mut profile = TokenProfile::default();
        for trace in traces {
            profile.add(&tokenize(&trace.prompt, self.vocab_size));
            profile.add(&tokenize(&trace.response, self.vocab_size));
        }
        Ok(profile)
    }
}

/// Normalized cross-entropy score: 1 for a perfect fit, 0 for the uniform distribution.
pub struct ReplayValidator {
    pub vocab_size: usize,
    /// Weight of the regression suite in the final score.
    pub regression_weight: f64,
}

impl ReplayValidator {
    fn score_texts<'a>(&self, profile: &TokenProfile, texts: impl Iterator<Item = &'a str>) -> Option<f64> {
        let mut nll = 0.0;
        let mut n = 0usize;
        for text in texts {
            for token in tokenize(text, self.vocab_size) {
                nll -= profile.probability(token, self.vocab_size).ln();
                n += 1;
            }
        }
        if n == 0 {
            return None;
        }
        let uniform = (self.vocab_size.max(2) as f64).ln();
        Some((1.0 - (nll / n as f64) / uniform).clamp(0.0, 1.0))
    }
}

impl Validator for ReplayValidator {
    fn evaluate(
        &self,
        profile: &TokenProfile,
        holdout: &[DistillationTrace],
        regression: &[String],
    ) -> f64 {
        let held = self.score_texts(
            profile,
            holdout
                .iter()
                .flat_map(|t| [t.prompt.as_str(), t.response.as_str()]),
        );
        let replay = self.score_texts(profile, regression.iter().map(String::as_str));
        match (held, replay) {
            (Some(h), Some(r)) => (1.0 - self.regression_weight) * h + self.regression_weight * r,
            (Some(h), None) => h,
            (None, Some(r)) => r,
            (None, None) => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionOutcome {
    Promoted {
        adapter: AdapterRef,
        previous: AdapterRef,
    },
    Rejected {
        adapter_id: String,
        score: f64,
        deployed: f64,
        epsilon: f64,
    },
    Conflict {
        detail: String,
    },
    Skipped {
        reason: String,
    },
    /// Training or scoring the candidate failed; the deployed adapter is untouched.
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TierOutcome {
    pub tier: TierId,
    #[serde(flatten)]
    pub outcome: PromotionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistillationReport {
    pub run_id: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub traces_considered: usize,
    pub traces_selected: usize,
    pub train_size: usize,
    pub holdout_size: usize,
    pub regression_prompts: usize,
    pub outcomes: Vec<TierOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_segment: Option<PathBuf>,
}

impl DistillationReport {
    pub fn outcome(&self, tier: TierId) -> Option<&PromotionOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.tier == tier)
            .map(|o| &o.outcome)
    }
}

pub struct DistillationPipeline {
    config: DistillationConfig,
    registry: Arc<TierRegistry>,
    traces: Arc<TraceStore>,
    decisions: Arc<DecisionLog>,
    adapters: AdapterStore,
    trainer: Arc<dyn Trainer>,
    validator: Arc<dyn Validator>,
    archive: Option<TraceArchive>,
    cursor: Mutex<u64>,
    run_gate: tokio::sync::Mutex<()>,
    monitor: Mutex<QualityMonitor>,
    metrics: Option<Arc<Metrics>>,
}

impl DistillationPipeline {
    pub fn new(
        config: DistillationConfig,
        registry: Arc<TierRegistry>,
        traces: Arc<TraceStore>,
        decisions: Arc<DecisionLog>,
        trainer: Arc<dyn Trainer>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        let monitor = QualityMonitor::new(
            config.monitor_ema_alpha,
            config.monitor_window,
            config.epsilon,
        );
        Self {
            config,
            registry,
            traces,
            decisions,
            adapters: AdapterStore::new(),
            trainer,
            validator,
            archive: None,
            cursor: Mutex::new(0),
            run_gate: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(monitor),
            metrics: None,
        }
    }

    pub fn with_archive(mut self, archive: TraceArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn adapters(&self) -> &AdapterStore {
        &self.adapters
    }

    pub fn watch_status(&self, tier: TierId) -> Option<WatchStatus> {
        self.monitor.lock().status(tier)
    }

    fn count(&self, tier: TierId, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.adapters
                .with_label_values(&[tier.as_str(), outcome])
                .inc();
        }
    }

    /// Run the pipeline once. Fails with `AlreadyRunning` if another run holds the gate.
    pub async fn run_once(&self) -> Result<DistillationReport, DistillationError> {
        let _gate = self
            .run_gate
            .try_lock()
            .map_err(|_| DistillationError::AlreadyRunning)?;

        let started_at = unix_millis();
        let run_id = Uuid::new_v4().to_string();
        let cursor = *self.cursor.lock();
        let fresh = self.traces.since(cursor);
        let watermark = fresh.last().map(|t| t.seq + 1).unwrap_or(cursor);

        let selected: Vec<DistillationTrace> = fresh
            .iter()
            .filter(|t| t.quality_score >= self.config.quality_threshold)
            .cloned()
            .collect();
        let regression = self.decisions.recent_prompts(self.config.regression_window);

        let mut report = DistillationReport {
            run_id,
            started_at,
            finished_at: started_at,
            traces_considered: fresh.len(),
            traces_selected: selected.len(),
            train_size: 0,
            holdout_size: 0,
            regression_prompts: regression.len(),
            outcomes: Vec::new(),
            archived_segment: None,
        };

        if selected.len() < self.config.min_traces.max(2) {
            // Leave the cursor so traces accumulate until the next run.
            let reason = format!(
                "insufficient traces: {} selected, {} required",
                selected.len(),
                self.config.min_traces.max(2)
            );
            info!(run_id = report.run_id, reason, "Distillation skipped");
            for &tier in &self.config.targets {
                report.outcomes.push(TierOutcome {
                    tier,
                    outcome: PromotionOutcome::Skipped {
                        reason: reason.clone(),
                    },
                });
            }
            report.finished_at = unix_millis();
            return Ok(report);
        }

        let (train, holdout) = split_holdout(selected, self.config.holdout_fraction);
        report.train_size = train.len();
        report.holdout_size = holdout.len();
        let train = Arc::new(train);
        let holdout = Arc::new(holdout);
        let regression = Arc::new(regression);

        info!(
            run_id = report.run_id,
            train = report.train_size,
            holdout = report.holdout_size,
            regression = report.regression_prompts,
            "Distillation run started"
        );

        // A failing target does not stop the others; the batch is consumed either way.
        for &tier in &self.config.targets {
            let outcome = match self.distill_tier(tier, &train, &holdout, &regression).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(run_id = report.run_id, tier = %tier, "{e}");
                    self.count(tier, "failed");
                    PromotionOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.outcomes.push(TierOutcome { tier, outcome });
        }

        if let Some(archive) = &self.archive {
            match archive.write_segment(&fresh).await {
                Ok(path) => report.archived_segment = Some(path),
                Err(e) => warn!("Trace archive write failed: {e}"),
            }
        }

        *self.cursor.lock() = watermark;
        report.finished_at = unix_millis();
        info!(run_id = report.run_id, "Distillation run complete");
        Ok(report)
    }

    async fn distill_tier(
        &self,
        tier: TierId,
        train: &Arc<Vec<DistillationTrace>>,
        holdout: &Arc<Vec<DistillationTrace>>,
        regression: &Arc<Vec<String>>,
    ) -> Result<PromotionOutcome, DistillationError> {
        let deployed = self.registry.model_ref(tier);

        // Training and scoring are CPU-bound; keep them off the async workers.
        let (trainer, validator) = (Arc::clone(&self.trainer), Arc::clone(&self.validator));
        let (train_set, holdout_set, replay) =
            (Arc::clone(train), Arc::clone(holdout), Arc::clone(regression));
        let base = deployed.clone();
        let trained = tokio::task::spawn_blocking(move || {
            let profile = trainer.train(tier, &base, &train_set)?;
            let score = validator.evaluate(&profile, &holdout_set, &replay);
            Ok::<_, anyhow::Error>((profile, score))
        })
        .await
        .map_err(|e| DistillationError::Training {
            tier,
            message: e.to_string(),
        })?;
        let (profile, score) = trained.map_err(|e| DistillationError::Training {
            tier,
            message: e.to_string(),
        })?;

        let version = self.adapters.next_version(tier);
        let candidate = Adapter {
            id: format!("{tier}-distilled-v{version}"),
            base_model: deployed.base_model.clone(),
            version,
            target: tier,
            trained_from_traces: train.iter().map(|t| t.seq).collect(),
            validation_score: score,
            deployed_at: None,
            profile: Arc::new(profile),
        };

        if deployed.validation_score - score > self.config.epsilon {
            let failure = ServingError::ValidationFailed {
                adapter_id: candidate.id.clone(),
                score,
                deployed: deployed.validation_score,
                epsilon: self.config.epsilon,
            };
            warn!(tier = %tier, "{failure}");
            self.registry.events().emit(
                EventKind::ValidationFailed,
                Some(tier),
                failure.to_string(),
            );
            self.count(tier, "rejected");
            let adapter_id = candidate.id.clone();
            self.adapters.record_rejected(candidate);
            return Ok(PromotionOutcome::Rejected {
                adapter_id,
                score,
                deployed: deployed.validation_score,
                epsilon: self.config.epsilon,
            });
        }

        let descriptor = candidate.descriptor();
        match self
            .registry
            .swap_model_ref(tier, deployed.version, descriptor.clone())
        {
            Ok(registry_version) => {
                self.adapters.record_deployed(candidate);
                self.monitor.lock().watch(tier, &descriptor);
                self.registry.events().emit(
                    EventKind::AdapterPromoted,
                    Some(tier),
                    format!(
                        "{} v{} score {:.4} (was {} v{} score {:.4})",
                        descriptor.id,
                        descriptor.version,
                        score,
                        deployed.id,
                        deployed.version,
                        deployed.validation_score
                    ),
                );
                self.count(tier, "promoted");
                info!(
                    tier = %tier,
                    adapter = descriptor.id,
                    score,
                    registry_version,
                    "Adapter promoted"
                );
                Ok(PromotionOutcome::Promoted {
                    adapter: descriptor,
                    previous: deployed,
                })
            }
            Err(conflict) => {
                warn!(tier = %tier, "Promotion aborted: {conflict}");
                self.count(tier, "conflict");
                self.adapters.record_rejected(candidate);
                Ok(PromotionOutcome::Conflict {
                    detail: conflict.to_string(),
                })
            }
        }
    }

    /// Restore the previously deployed adapter (or the base model) on `tier`.
    pub fn rollback(&self, tier: TierId, reason: &str) -> Result<AdapterRef, DistillationError> {
        let current = self.registry.model_ref(tier);
        let (retired, live) = self
            .adapters
            .roll_back(tier)
            .ok_or(DistillationError::NothingToRollBack(tier))?;
        if retired.id != current.id {
            // The registry is not serving what the store thinks is live.
            self.adapters.restore(tier);
            return Err(DistillationError::NothingToRollBack(tier));
        }

        let restored = live
            .map(|a| a.descriptor())
            .unwrap_or_else(|| AdapterRef::baseline(&retired.base_model));
        if let Err(e) = self
            .registry
            .swap_model_ref(tier, current.version, restored.clone())
        {
            self.adapters.restore(tier);
            return Err(e.into());
        }

        self.monitor.lock().stop(tier);
        self.registry.events().emit(
            EventKind::AdapterRolledback,
            Some(tier),
            format!(
                "{} v{} -> {} v{}: {reason}",
                retired.id, retired.version, restored.id, restored.version
            ),
        );
        self.count(tier, "rolled_back");
        warn!(
            tier = %tier,
            from = retired.id,
            to = restored.id,
            reason,
            "Adapter rolled back"
        );
        Ok(restored)
    }

    /// Feed one quality sample to the monitor, rolling back on a regression.
    pub fn observe_quality(&self, sample: QualitySample) -> Verdict {
        let verdict = self.monitor.lock().observe(sample);
        match &verdict {
            Verdict::Regressed { baseline, observed } => {
                let reason = format!(
                    "post-deployment quality {observed:.3} below baseline {baseline:.3}"
                );
                if let Err(e) = self.rollback(sample.tier, &reason) {
                    error!(tier = %sample.tier, "Automatic rollback failed: {e}");
                }
            }
            Verdict::Passed { observed } => {
                info!(tier = %sample.tier, observed, "Adapter passed post-deployment monitoring");
            }
            Verdict::Idle | Verdict::Watching => {}
        }
        verdict
    }

    /// Consume quality samples from the router until shutdown.
    pub async fn run_monitor(
        self: Arc<Self>,
        mut samples: mpsc::Receiver<QualitySample>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                sample = samples.recv() => match sample {
                    Some(sample) => {
                        self.observe_quality(sample);
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Run the pipeline every configured interval until shutdown.
    pub async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.interval().max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        info!(interval_secs = period.as_secs(), "Distillation scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.run_once().await {
                    Ok(report) => info!(
                        run_id = report.run_id,
                        selected = report.traces_selected,
                        "Scheduled distillation finished"
                    ),
                    Err(e) => error!("Scheduled distillation failed: {e}"),
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Deterministic split: a trace lands in the holdout set by a hash of its
/// sequence number. Both sides are kept non-empty.
fn split_holdout(
    traces: Vec<DistillationTrace>,
    fraction: f64,
) -> (Vec<DistillationTrace>, Vec<DistillationTrace>) {
    let (mut holdout, mut train): (Vec<_>, Vec<_>) = traces
        .into_iter()
        .partition(|t| text_unit(&t.seq.to_string()) < fraction);
    if holdout.is_empty() {
        if let Some(t) = train.pop() {
            holdout.push(t);
        }
    }
    if train.is_empty() {
        if let Some(t) = holdout.pop() {
            train.push(t);
        }
    }
    (train, holdout)
}
