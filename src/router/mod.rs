//! Intelligent Router: the composition point of the serving layer.
//!
//! - [`envelope`]: request/response envelopes and SLA classes
//! - [`policy`]: tier ladder and admission rules
//! - [`recorder`]: non-blocking decision log
//!
//! Per request: build the ladder for the SLA class, walk it skipping tiers
//! that are unhealthy or saturated, give each attempt a deadline that leaves
//! room for the next rung, run the tier output through the guardrail, and
//! record the decision. When nothing can serve, the caller gets the safe
//! default instead of an error.

pub mod envelope;
pub mod policy;
pub mod recorder;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, RouterConfig};
use crate::distill::monitor::QualitySample;
use crate::error::ServingError;
use crate::events::unix_millis;
use crate::guardrail::GuardrailFilter;
use crate::metrics::Metrics;
use crate::registry::descriptor::{HealthState, TierId};
use crate::registry::load::ProbeGuard;
use crate::registry::TierRegistry;
use crate::tiers::{TierClients, TierOutput};
use envelope::{RequestEnvelope, ResponseEnvelope, ResponseSource, SlaClass};
use policy::{RoutePlan, Skip, TierView};
use recorder::{DecisionLog, DecisionRecord, DecisionRecorder};

pub struct Router {
    registry: Arc<TierRegistry>,
    clients: TierClients,
    guardrail: Arc<GuardrailFilter>,
    recorder: DecisionRecorder,
    settings: RouterConfig,
    thresholds: [usize; 3],
    budgets: [Duration; 3],
    probe_limit: u32,
    quality: Option<mpsc::Sender<QualitySample>>,
    metrics: Option<Arc<Metrics>>,
}

/// Bookkeeping for one walk down the ladder.
struct Attempts {
    plan: RoutePlan,
    /// Tiers passed over or failed, with the reason.
    fallbacks: Vec<(TierId, String)>,
    attempted: Vec<TierId>,
    started: Instant,
}

impl Router {
    pub fn new(
        config: &Config,
        registry: Arc<TierRegistry>,
        clients: TierClients,
        guardrail: Arc<GuardrailFilter>,
        recorder: DecisionRecorder,
    ) -> Self {
        Self {
            registry,
            clients,
            guardrail,
            recorder,
            settings: config.router.clone(),
            thresholds: TierId::ALL.map(|t| config.queue_threshold(t)),
            budgets: TierId::ALL.map(|t| config.tiers.tier(t).latency_budget()),
            probe_limit: config.tiers.half_open_max_probes,
            quality: None,
            metrics: None,
        }
    }

    /// Publish a quality sample for every model response.
    pub fn with_quality_channel(mut self, tx: mpsc::Sender<QualitySample>) -> Self {
        self.quality = Some(tx);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    pub fn decisions(&self) -> &Arc<DecisionLog> {
        self.recorder.log()
    }

    pub fn dropped_decisions(&self) -> u64 {
        self.recorder.dropped()
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.settings.default_deadline_ms)
    }

    fn view(&self, tier: TierId) -> TierView {
        TierView {
            health: self.registry.health(tier),
            queue_depth: self.registry.load(tier).queue_depth(),
            threshold: self.thresholds[tier.level() as usize],
        }
    }

    /// Route a request. Never fails: exhaustion yields the safe default.
    pub async fn route(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let started = Instant::now();
        match self.try_route(&request).await {
            Ok(response) => response,
            Err(e) => self.default_response(&request, &e, started),
        }
    }

    /// Route a request, surfacing `AllTiersExhausted` instead of the safe default.
    pub async fn try_route(
        &self,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, ServingError> {
        let warm_gold = (request.sla_class == SlaClass::Interactive
            && self.clients.gold.is_warm(&request.entity_id))
        .then(|| self.view(TierId::Gold));

        let mut attempts = Attempts {
            plan: policy::plan(request.sla_class, warm_gold),
            fallbacks: Vec::new(),
            attempted: Vec::new(),
            started: Instant::now(),
        };
        let overhead = self.settings.fallback_overhead();
        let rungs = attempts.plan.ladder.clone();

        for (i, &tier) in rungs.iter().enumerate() {
            let is_last = i + 1 == rungs.len();
            let view = self.view(tier);
            // Held until the attempt below finishes.
            let _probe = match policy::admit(view, is_last) {
                Ok(()) => None,
                Err(skip) => match self.half_open_probe(tier, &skip) {
                    Some(probe) => {
                        debug!(tier = %tier, entity_id = request.entity_id, "Probing degraded tier");
                        Some(probe)
                    }
                    None => {
                        debug!(tier = %tier, entity_id = request.entity_id, reason = %skip, "Skipping tier");
                        attempts.fallbacks.push((tier, skip.to_string()));
                        continue;
                    }
                },
            };

            let now = Instant::now();
            let deadline = if is_last {
                request.deadline
            } else {
                let reserve = request.deadline.checked_sub(overhead).unwrap_or(now);
                reserve.min(now + self.budgets[tier.level() as usize])
            };
            if deadline <= now {
                attempts.fallbacks.push((tier, "deadline exhausted".to_string()));
                continue;
            }

            attempts.attempted.push(tier);
            match self.attempt(tier, request, deadline, overhead).await {
                Ok(output) => return Ok(self.finish(request, tier, view.health, output, attempts)),
                Err(e) if e.is_fallback_eligible() => {
                    info!(tier = %tier, entity_id = request.entity_id, "Falling back: {e}");
                    attempts.fallbacks.push((tier, e.code().to_string()));
                }
                Err(e) => return Ok(self.surface(request, tier, e, attempts)),
            }
        }

        let error = ServingError::AllTiersExhausted {
            attempted: attempts.attempted.clone(),
        };
        warn!(
            entity_id = request.entity_id,
            trace_id = request.id,
            sla_class = %request.sla_class,
            "{error}"
        );
        if let Some(m) = &self.metrics {
            m.exhausted.inc();
            for (from, _) in &attempts.fallbacks {
                m.fallbacks
                    .with_label_values(&[from.as_str(), "default"])
                    .inc();
            }
        }
        self.record(request, &attempts, None, true, error.code());
        Err(error)
    }

    /// A probe slot on a tier the monitor marked degraded. Operator overrides
    /// are never probed.
    fn half_open_probe(&self, tier: TierId, skip: &Skip) -> Option<ProbeGuard> {
        if *skip != Skip::Unhealthy(HealthState::Degraded) || self.registry.is_overridden(tier) {
            return None;
        }
        self.registry.load(tier).try_probe(self.probe_limit)
    }

    /// One tier call, bounded even if the client overruns its deadline.
    async fn attempt(
        &self,
        tier: TierId,
        request: &RequestEnvelope,
        deadline: Instant,
        overhead: Duration,
    ) -> Result<TierOutput, ServingError> {
        let load = Arc::clone(self.registry.load(tier));
        let _in_flight = load.enter();
        let started = Instant::now();
        let client = self.clients.get(tier);
        let call = client.infer(request, deadline);
        let result = match tokio::time::timeout_at(deadline + overhead, call).await {
            Ok(result) => result,
            Err(_) => Err(ServingError::Timeout { tier: Some(tier) }),
        };
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => load.record_success(elapsed),
            // Job failures are the job's problem, not the tier's.
            Err(e) if e.is_fallback_eligible() => load.record_failure(elapsed),
            Err(_) => load.record_success(elapsed),
        }
        result
    }

    fn finish(
        &self,
        request: &RequestEnvelope,
        tier: TierId,
        health: HealthState,
        output: TierOutput,
        attempts: Attempts,
    ) -> ResponseEnvelope {
        let degraded = attempts.plan.is_fallback(tier)
            || health != HealthState::Healthy
            || output.source == ResponseSource::Guardrail;
        let produced = matches!(
            output.source,
            ResponseSource::Model | ResponseSource::Prediction
        );
        let response = self.guardrail.filter(ResponseEnvelope {
            request_id: request.id.clone(),
            entity_id: request.entity_id.clone(),
            content: output.content,
            tier_used: Some(tier),
            degraded,
            source: output.source,
            job_id: output.job_id,
            latency_ms: elapsed_ms(attempts.started),
            error: None,
        });

        if produced {
            self.publish_quality(QualitySample {
                tier,
                adapter_version: output.adapter_version,
                score: if response.source == ResponseSource::Guardrail {
                    0.0
                } else {
                    1.0
                },
            });
        }
        if let Some(m) = &self.metrics {
            m.routed
                .with_label_values(&[tier.as_str(), bool_label(response.degraded)])
                .inc();
            m.route_latency
                .with_label_values(&[tier.as_str()])
                .observe(response.latency_ms / 1000.0);
            for (from, _) in &attempts.fallbacks {
                m.fallbacks
                    .with_label_values(&[from.as_str(), tier.as_str()])
                    .inc();
            }
        }
        if response.degraded {
            info!(
                tier = %tier,
                preferred = %attempts.plan.preferred,
                entity_id = request.entity_id,
                latency_ms = response.latency_ms,
                "Served degraded"
            );
        }
        let outcome = match response.source {
            ResponseSource::Job => "job_pending",
            ResponseSource::Prediction => "prediction",
            ResponseSource::Guardrail => "guardrail",
            _ => "ok",
        };
        self.record(request, &attempts, Some(tier), response.degraded, outcome);
        response
    }

    /// A tier error that fallback must not hide, such as a failed async job.
    fn surface(
        &self,
        request: &RequestEnvelope,
        tier: TierId,
        error: ServingError,
        attempts: Attempts,
    ) -> ResponseEnvelope {
        warn!(tier = %tier, entity_id = request.entity_id, trace_id = request.id, "{error}");
        let job_id = match &error {
            ServingError::JobFailed { job_id, .. } | ServingError::JobTimedOut { job_id, .. } => {
                Some(job_id.clone())
            }
            _ => None,
        };
        self.record(request, &attempts, Some(tier), true, error.code());
        ResponseEnvelope {
            request_id: request.id.clone(),
            entity_id: request.entity_id.clone(),
            content: self.settings.default_response.clone(),
            tier_used: Some(tier),
            degraded: true,
            source: ResponseSource::Default,
            job_id,
            latency_ms: elapsed_ms(attempts.started),
            error: Some(error.to_string()),
        }
    }

    fn default_response(
        &self,
        request: &RequestEnvelope,
        error: &ServingError,
        started: Instant,
    ) -> ResponseEnvelope {
        ResponseEnvelope {
            request_id: request.id.clone(),
            entity_id: request.entity_id.clone(),
            content: self.settings.default_response.clone(),
            tier_used: None,
            degraded: true,
            source: ResponseSource::Default,
            job_id: None,
            latency_ms: elapsed_ms(started),
            error: Some(error.code().to_string()),
        }
    }

    fn publish_quality(&self, sample: QualitySample) {
        if let Some(tx) = &self.quality {
            // A full channel only loses a monitoring sample.
            let _ = tx.try_send(sample);
        }
    }

    fn record(
        &self,
        request: &RequestEnvelope,
        attempts: &Attempts,
        tier_used: Option<TierId>,
        degraded: bool,
        outcome: &str,
    ) {
        self.recorder.record(DecisionRecord {
            request_id: request.id.clone(),
            entity_id: request.entity_id.clone(),
            sla_class: request.sla_class,
            prompt: request.context.prompt.clone(),
            preferred: attempts.plan.preferred,
            tier_used,
            fallbacks: attempts.fallbacks.clone(),
            degraded,
            latency_ms: elapsed_ms(attempts.started),
            outcome: outcome.to_string(),
            timestamp: unix_millis(),
        });
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

fn bool_label(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}
