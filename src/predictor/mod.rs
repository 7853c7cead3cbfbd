//! Silver-tier state predictor.
//!
//! Live requests hand their context and response to the predictor with a
//! non-blocking `try_send`. A background worker forecasts each entity's next
//! request, precomputes a response and publishes a [`PredictionRecord`] into a
//! concurrent map. On a real request, [`StatePredictor::take_match`] consumes a
//! record whose context is similar enough and whose TTL has not lapsed. The
//! live path never waits for the worker: a prediction still being computed is
//! simply not there yet.

pub mod forecast;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PredictorConfig;
use crate::metrics::Metrics;
use crate::predictor::forecast::{similarity, TransitionForecaster};
use crate::router::envelope::GenerationContext;

#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub entity_id: String,
    pub predicted_context: GenerationContext,
    pub predicted_at: Instant,
    pub ttl: Duration,
    pub confidence: f64,
    /// Precomputed response for `predicted_context`.
    pub response: String,
}

impl PredictionRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.predicted_at) >= self.ttl
    }

    fn matches(&self, context: &GenerationContext, threshold: f64) -> bool {
        self.predicted_context.system == context.system
            && similarity(&self.predicted_context.prompt, &context.prompt) >= threshold
    }
}

/// Produces the response a prediction will serve.
#[async_trait]
pub trait Precompute: Send + Sync {
    async fn precompute(&self, entity_id: &str, context: &GenerationContext) -> anyhow::Result<String>;
}

#[derive(Debug)]
pub struct Observation {
    pub entity_id: String,
    pub context: GenerationContext,
    pub response: String,
}

/// Receiving end of the observation queue, consumed by [`StatePredictor::run`].
pub struct ObservationQueue(mpsc::Receiver<Observation>);

#[derive(Debug, Clone, Serialize)]
pub struct PredictorStats {
    pub pending: usize,
    pub published: u64,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub dropped: u64,
}

pub struct StatePredictor {
    config: PredictorConfig,
    records: DashMap<String, PredictionRecord>,
    forecaster: TransitionForecaster,
    tx: mpsc::Sender<Observation>,
    published: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    dropped: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl StatePredictor {
    pub fn new(config: PredictorConfig) -> (Self, ObservationQueue) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let predictor = Self {
            forecaster: TransitionForecaster::new(0.5),
            config,
            records: DashMap::new(),
            tx,
            published: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            metrics: None,
        };
        (predictor, ObservationQueue(rx))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn count(&self, counter: &AtomicU64, outcome: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.predictions.with_label_values(&[outcome]).inc();
        }
    }

    /// Queue a served request for forecasting. Drops the observation if the queue is full.
    pub fn observe(&self, entity_id: &str, context: &GenerationContext, response: &str) {
        if !self.config.enabled {
            return;
        }
        let observation = Observation {
            entity_id: entity_id.to_string(),
            context: context.clone(),
            response: response.to_string(),
        };
        if self.tx.try_send(observation).is_err() {
            self.count(&self.dropped, "dropped");
            debug!(entity_id, "Prediction queue full, observation dropped");
        }
    }

    /// Consume a live prediction matching `context`, if any. Expired records are discarded.
    pub fn take_match(&self, entity_id: &str, context: &GenerationContext) -> Option<PredictionRecord> {
        let now = Instant::now();
        let threshold = self.config.similarity_threshold;
        let removed = self.records.remove_if(entity_id, |_, record| {
            record.is_expired(now) || record.matches(context, threshold)
        });

        match removed {
            Some((_, record)) if !record.is_expired(now) => {
                self.count(&self.hits, "hit");
                debug!(entity_id, confidence = record.confidence, "Prediction hit");
                Some(record)
            }
            Some(_) => {
                self.count(&self.expired, "expired");
                self.count(&self.misses, "miss");
                None
            }
            None => {
                self.count(&self.misses, "miss");
                None
            }
        }
    }

    /// Forecast the entity's next request and precompute its response.
    ///
    /// Returns `None` when there is no forecast, its confidence is below the
    /// configured minimum, or precomputation fails.
    pub async fn predict_next(
        &self,
        entity_id: &str,
        recent: &GenerationContext,
        last_response: &str,
        precompute: &dyn Precompute,
    ) -> Option<PredictionRecord> {
        let forecast = self.forecaster.forecast(entity_id, recent, last_response)?;
        if forecast.confidence < self.config.min_confidence {
            return None;
        }
        match precompute.precompute(entity_id, &forecast.context).await {
            Ok(response) => Some(PredictionRecord {
                entity_id: entity_id.to_string(),
                predicted_context: forecast.context,
                predicted_at: Instant::now(),
                ttl: self.config.ttl(),
                confidence: forecast.confidence,
                response,
            }),
            Err(e) => {
                warn!(entity_id, "Prediction precompute failed: {e}");
                None
            }
        }
    }

    /// Make a prediction visible to the live path, replacing any older one.
    pub fn publish(&self, record: PredictionRecord) {
        self.records.insert(record.entity_id.clone(), record);
        self.count(&self.published, "published");
    }

    /// Drop expired predictions. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let purged = before.saturating_sub(self.records.len());
        for _ in 0..purged {
            self.count(&self.expired, "expired");
        }
        purged
    }

    async fn handle(&self, observation: Observation, precompute: &dyn Precompute) {
        self.forecaster
            .observe(&observation.entity_id, &observation.context.prompt);
        if let Some(record) = self
            .predict_next(
                &observation.entity_id,
                &observation.context,
                &observation.response,
                precompute,
            )
            .await
        {
            self.publish(record);
        }
    }

    /// Background worker: consume observations, publish predictions and sweep expired ones.
    pub async fn run(
        self: Arc<Self>,
        queue: ObservationQueue,
        precompute: Arc<dyn Precompute>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let ObservationQueue(mut rx) = queue;
        let mut sweep = tokio::time::interval(Duration::from_millis(
            self.config.sweep_interval_ms.max(1),
        ));
        info!("State predictor started");
        loop {
            tokio::select! {
                observation = rx.recv() => match observation {
                    Some(observation) => self.handle(observation, precompute.as_ref()).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    let purged = self.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Expired predictions discarded");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("State predictor stopped");
    }

    pub fn pending(&self, entity_id: &str) -> Option<PredictionRecord> {
        self.records.get(entity_id).map(|r| r.clone())
    }

    pub fn stats(&self) -> PredictorStats {
        PredictorStats {
            pending: self.records.len(),
            published: self.published.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Precompute for Echo {
        async fn precompute(&self, _entity_id: &str, context: &GenerationContext) -> anyhow::Result<String> {
            Ok(format!("re: {}", context.prompt))
        }
    }

    fn predictor(ttl_ms: u64) -> StatePredictor {
        StatePredictor::new(PredictorConfig {
            ttl_ms,
            ..Default::default()
        })
        .0
    }

    fn record(entity: &str, prompt: &str, ttl: Duration) -> PredictionRecord {
        PredictionRecord {
            entity_id: entity.into(),
            predicted_context: GenerationContext::prompt(prompt),
            predicted_at: Instant::now(),
            ttl,
            confidence: 0.9,
            response: "precomputed".into(),
        }
    }

    #[tokio::test]
    async fn test_match_consumes_record() {
        let p = predictor(5000);
        p.publish(record("npc", "what is for sale", Duration::from_secs(5)));

        assert!(p
            .take_match("npc", &GenerationContext::prompt("something else entirely"))
            .is_none());
        let hit = p
            .take_match("npc", &GenerationContext::prompt("What is for sale?"))
            .unwrap();
        assert_eq!(hit.response, "precomputed");
        assert!(p
            .take_match("npc", &GenerationContext::prompt("what is for sale"))
            .is_none());
        assert_eq!(p.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_expired_record_is_discarded() {
        let p = predictor(5000);
        p.publish(record("npc", "hello", Duration::ZERO));
        assert!(p.take_match("npc", &GenerationContext::prompt("hello")).is_none());
        assert!(p.pending("npc").is_none());
        assert_eq!(p.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_system_segment_must_match() {
        let p = predictor(5000);
        let mut rec = record("npc", "hello", Duration::from_secs(5));
        rec.predicted_context.system = Some("You are a smith.".into());
        p.publish(rec);
        assert!(p.take_match("npc", &GenerationContext::prompt("hello")).is_none());
    }

    #[tokio::test]
    async fn test_predict_next_respects_min_confidence() {
        let (p, _queue) = StatePredictor::new(PredictorConfig {
            min_confidence: 0.9,
            ..Default::default()
        });
        p.forecaster.observe("npc", "hello");
        let ctx = GenerationContext::prompt("hello");
        assert!(p.predict_next("npc", &ctx, "hi", &Echo).await.is_none());
    }

    #[tokio::test]
    async fn test_worker_publishes_predictions() {
        let (p, queue) = StatePredictor::new(PredictorConfig::default());
        let p = Arc::new(p);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Arc::clone(&p).run(queue, Arc::new(Echo), shutdown_rx));

        p.observe("npc", &GenerationContext::prompt("any rumours"), "none");
        let deadline = Instant::now() + Duration::from_secs(2);
        while p.pending("npc").is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let pending = p.pending("npc").unwrap();
        assert_eq!(pending.response, "re: any rumours");

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
