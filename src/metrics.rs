//! Prometheus metrics for routing, caching, jobs and distillation.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub routed: IntCounterVec,
    pub fallbacks: IntCounterVec,
    pub exhausted: IntCounter,
    pub guardrail_violations: IntCounterVec,
    pub route_latency: HistogramVec,
    pub cache_lookups: IntCounterVec,
    pub cache_evictions: IntCounter,
    pub predictions: IntCounterVec,
    pub speculative_acceptance: Histogram,
    pub speculative_speedup: Histogram,
    pub jobs: IntCounterVec,
    pub adapters: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("tier_router".to_string()), None)?;

        let routed = IntCounterVec::new(
            Opts::new("routed_total", "Requests served, by tier and degraded flag"),
            &["tier", "degraded"],
        )?;
        let fallbacks = IntCounterVec::new(
            Opts::new("fallbacks_total", "Fallbacks taken, by source and destination tier"),
            &["from", "to"],
        )?;
        let exhausted = IntCounter::new(
            "tiers_exhausted_total",
            "Requests answered with the safe default after every tier failed",
        )?;
        let guardrail_violations = IntCounterVec::new(
            Opts::new("guardrail_violations_total", "Responses replaced by the guardrail"),
            &["tier"],
        )?;
        let route_latency = HistogramVec::new(
            HistogramOpts::new("route_latency_seconds", "End-to-end routing latency")
                .buckets(vec![
                    0.001, 0.0025, 0.005, 0.01, 0.016, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
            &["tier"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("cache_lookups_total", "KV cache lookups, by cache class and result"),
            &["class", "result"],
        )?;
        let cache_evictions =
            IntCounter::new("cache_evictions_total", "KV cache entries evicted")?;
        let predictions = IntCounterVec::new(
            Opts::new("predictions_total", "State predictor outcomes"),
            &["outcome"],
        )?;
        let speculative_acceptance = Histogram::with_opts(
            HistogramOpts::new(
                "speculative_acceptance_ratio",
                "Fraction of draft tokens accepted per decode",
            )
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
        )?;
        let speculative_speedup = Histogram::with_opts(
            HistogramOpts::new(
                "speculative_speedup",
                "Realized speedup versus target-only decoding",
            )
            .buckets(vec![0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 4.0, 5.0]),
        )?;
        let jobs = IntCounterVec::new(
            Opts::new("jobs_total", "Async jobs reaching a terminal status"),
            &["status"],
        )?;
        let adapters = IntCounterVec::new(
            Opts::new("adapter_decisions_total", "Adapter promotion outcomes"),
            &["tier", "outcome"],
        )?;

        registry.register(Box::new(routed.clone()))?;
        registry.register(Box::new(fallbacks.clone()))?;
        registry.register(Box::new(exhausted.clone()))?;
        registry.register(Box::new(guardrail_violations.clone()))?;
        registry.register(Box::new(route_latency.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(predictions.clone()))?;
        registry.register(Box::new(speculative_acceptance.clone()))?;
        registry.register(Box::new(speculative_speedup.clone()))?;
        registry.register(Box::new(jobs.clone()))?;
        registry.register(Box::new(adapters.clone()))?;

        Ok(Self {
            registry,
            routed,
            fallbacks,
            exhausted,
            guardrail_violations,
            route_latency,
            cache_lookups,
            cache_evictions,
            predictions,
            speculative_acceptance,
            speculative_speedup,
            jobs,
            adapters,
        })
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
