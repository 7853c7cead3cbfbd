//! Wiring: builds every component from a [`Config`] and owns the background loops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::manager::KvCacheManager;
use crate::config::Config;
use crate::distill::pipeline::{ReplayValidator, TraceStatsTrainer};
use crate::distill::trace::{TraceArchive, TraceStore};
use crate::distill::DistillationPipeline;
use crate::events::EventBus;
use crate::guardrail::GuardrailFilter;
use crate::inference::model::{ModelFactory, SyntheticModelFactory};
use crate::jobs::JobManager;
use crate::metrics::Metrics;
use crate::predictor::StatePredictor;
use crate::registry::health::HealthMonitor;
use crate::registry::TierRegistry;
use crate::router::recorder::DecisionRecorder;
use crate::router::Router;
use crate::tiers::bronze::{BronzeClient, BronzeExecutor};
use crate::tiers::gold::GoldClient;
use crate::tiers::silver::{SilverClient, SilverGenerator};
use crate::tiers::TierClients;

/// Quality samples buffered between the router and the adapter monitor.
const QUALITY_CHANNEL_CAPACITY: usize = 1024;

/// Recent events retained for late subscribers.
const EVENT_RETENTION: usize = 256;

/// Every live component plus the handles of its background tasks.
pub struct ServingStack {
    pub config: Arc<Config>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<TierRegistry>,
    pub gold: Arc<GoldClient>,
    pub gold_cache: Arc<KvCacheManager>,
    pub silver_cache: Arc<KvCacheManager>,
    pub predictor: Option<Arc<StatePredictor>>,
    pub jobs: Arc<JobManager>,
    pub traces: Arc<TraceStore>,
    pub router: Arc<Router>,
    pub pipeline: Arc<DistillationPipeline>,
    pub started_at: Instant,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServingStack {
    /// Build the stack on the synthetic model backend.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let factory = Arc::new(SyntheticModelFactory::new(
            config.speculative.vocab_size,
            config.speculative.temperature,
        ));
        Self::build_with(config, factory).await
    }

    /// Build the stack and spawn its background loops.
    pub async fn build_with(config: Config, factory: Arc<dyn ModelFactory>) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new()?);
        let events = Arc::new(EventBus::new(EVENT_RETENTION));
        let registry = Arc::new(TierRegistry::from_config(&config.tiers, Arc::clone(&events)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Gold: speculative decoding over a per-entity cache.
        let gold_cache =
            Arc::new(KvCacheManager::new("gold", &config.cache).with_metrics(Arc::clone(&metrics)));
        let gold = Arc::new(GoldClient::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&factory),
            Arc::clone(&gold_cache),
            Some(Arc::clone(&metrics)),
        ));

        // Silver: engine shared by live requests and the predictor's precompute.
        let silver_cache = Arc::new(
            KvCacheManager::new("silver", &config.cache).with_metrics(Arc::clone(&metrics)),
        );
        let generator = Arc::new(SilverGenerator::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&factory),
        ));
        let predictor = if config.predictor.enabled {
            let (predictor, queue) = StatePredictor::new(config.predictor.clone());
            let predictor = Arc::new(predictor.with_metrics(Arc::clone(&metrics)));
            tasks.push(tokio::spawn(Arc::clone(&predictor).run(
                queue,
                generator.clone(),
                shutdown_rx.clone(),
            )));
            Some(predictor)
        } else {
            None
        };
        let silver = Arc::new(SilverClient::new(
            &config,
            Arc::clone(&generator),
            Arc::clone(&silver_cache),
            predictor.clone(),
        ));

        // Bronze: async jobs whose results feed distillation.
        let traces = Arc::new(TraceStore::new());
        let executor = Arc::new(BronzeExecutor::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&factory),
        ));
        let guardrail = Arc::new(
            GuardrailFilter::new(&config.guardrail, Arc::clone(&events))
                .with_metrics(Arc::clone(&metrics)),
        );
        let jobs = Arc::new(
            JobManager::new(config.jobs.clone(), executor, Arc::clone(&traces))
                .with_guardrail(Arc::clone(&guardrail))
                .with_metrics(Arc::clone(&metrics)),
        );
        tasks.push(tokio::spawn(Arc::clone(&jobs).run_sweeper(shutdown_rx.clone())));
        let bronze = Arc::new(BronzeClient::new(Arc::clone(&jobs)));

        let (recorder, recorder_worker) = DecisionRecorder::new(config.router.decision_log_capacity);
        tasks.push(tokio::spawn(recorder_worker.run(shutdown_rx.clone())));

        let (quality_tx, quality_rx) = mpsc::channel(QUALITY_CHANNEL_CAPACITY);
        let router = Arc::new(
            Router::new(
                &config,
                Arc::clone(&registry),
                TierClients {
                    gold: gold.clone(),
                    silver,
                    bronze,
                },
                guardrail,
                recorder,
            )
            .with_quality_channel(quality_tx)
            .with_metrics(Arc::clone(&metrics)),
        );

        let vocab_size = config.speculative.vocab_size;
        let mut pipeline = DistillationPipeline::new(
            config.distillation.clone(),
            Arc::clone(&registry),
            Arc::clone(&traces),
            Arc::clone(router.decisions()),
            Arc::new(TraceStatsTrainer { vocab_size }),
            Arc::new(ReplayValidator {
                vocab_size,
                regression_weight: 0.3,
            }),
        )
        .with_metrics(Arc::clone(&metrics));
        if let Some(dir) = &config.distillation.archive_dir {
            let archive = TraceArchive::new(dir.clone(), config.distillation.zstd_level).await?;
            info!(dir = %dir.display(), "Trace archive enabled");
            pipeline = pipeline.with_archive(archive);
        }
        let pipeline = Arc::new(pipeline);
        tasks.push(tokio::spawn(
            Arc::clone(&pipeline).run_monitor(quality_rx, shutdown_rx.clone()),
        ));
        if config.distillation.enabled {
            tasks.push(tokio::spawn(
                Arc::clone(&pipeline).run_scheduler(shutdown_rx.clone()),
            ));
        }

        let monitor = HealthMonitor::new(Arc::clone(&registry), config.tiers.clone());
        tasks.push(tokio::spawn(monitor.run(shutdown_rx)));

        info!(
            gold_budget_ms = config.tiers.gold.latency_budget_ms,
            silver_budget_ms = config.tiers.silver.latency_budget_ms,
            predictor = config.predictor.enabled,
            distillation = config.distillation.enabled,
            "Serving stack ready"
        );

        Ok(Self {
            config,
            events,
            metrics,
            registry,
            gold,
            gold_cache,
            silver_cache,
            predictor,
            jobs,
            traces,
            router,
            pipeline,
            started_at: Instant::now(),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// A receiver that flips to `true` when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop every background loop and wait (bounded) for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Background task did not stop within 5s");
            }
        }
        info!("Serving stack stopped");
    }
}
