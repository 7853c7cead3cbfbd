//! Post-deployment quality monitoring.
//!
//! The router publishes one quality sample per tier response (1.0 when the
//! guardrail passed it, 0.0 when it fired). Each tier keeps a running EWMA.
//! When an adapter is promoted, the tier's EWMA at that moment becomes the
//! baseline and samples served by the new adapter feed a separate EWMA. Once
//! the monitoring window fills, the adapter either passes or is flagged for
//! rollback.

use std::collections::HashMap;

use serde::Serialize;

use crate::registry::descriptor::{AdapterRef, TierId};

#[derive(Debug, Clone, Copy)]
pub struct QualitySample {
    pub tier: TierId,
    /// Adapter that produced the response; `None` for precomputed or cached content.
    pub adapter_version: Option<u64>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Nothing under watch for this tier.
    Idle,
    Watching,
    Passed { observed: f64 },
    Regressed { baseline: f64, observed: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchStatus {
    pub adapter_id: String,
    pub version: u64,
    pub baseline: f64,
    pub observed: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct TierQuality {
    ema: Option<f64>,
    watch: Option<WatchStatus>,
}

pub struct QualityMonitor {
    tiers: HashMap<TierId, TierQuality>,
    alpha: f64,
    window: usize,
    epsilon: f64,
}

fn blend(ema: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match ema {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    }
}

impl QualityMonitor {
    pub fn new(alpha: f64, window: usize, epsilon: f64) -> Self {
        Self {
            tiers: HashMap::new(),
            alpha: alpha.clamp(0.0, 1.0),
            window: window.max(1),
            epsilon,
        }
    }

    /// Start watching a newly promoted adapter.
    pub fn watch(&mut self, tier: TierId, adapter: &AdapterRef) {
        let quality = self.tiers.entry(tier).or_default();
        quality.watch = Some(WatchStatus {
            adapter_id: adapter.id.clone(),
            version: adapter.version,
            baseline: quality.ema.unwrap_or(1.0),
            observed: None,
            samples: 0,
        });
    }

    pub fn stop(&mut self, tier: TierId) {
        if let Some(quality) = self.tiers.get_mut(&tier) {
            quality.watch = None;
        }
    }

    pub fn status(&self, tier: TierId) -> Option<WatchStatus> {
        self.tiers.get(&tier).and_then(|q| q.watch.clone())
    }

    pub fn observe(&mut self, sample: QualitySample) -> Verdict {
        let (alpha, window, epsilon) = (self.alpha, self.window, self.epsilon);
        let quality = self.tiers.entry(sample.tier).or_default();
        quality.ema = Some(blend(quality.ema, sample.score, alpha));

        let Some(watch) = quality.watch.as_mut() else {
            return Verdict::Idle;
        };
        if sample.adapter_version != Some(watch.version) {
            return Verdict::Watching;
        }

        let observed = blend(watch.observed, sample.score, alpha);
        watch.observed = Some(observed);
        watch.samples += 1;
        if watch.samples < window {
            return Verdict::Watching;
        }

        let baseline = watch.baseline;
        quality.watch = None;
        if observed < baseline - epsilon {
            Verdict::Regressed { baseline, observed }
        } else {
            Verdict::Passed { observed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(version: u64) -> AdapterRef {
        AdapterRef {
            id: format!("a{version}"),
            base_model: "m".into(),
            version,
            validation_score: 0.5,
        }
    }

    fn sample(version: Option<u64>, score: f64) -> QualitySample {
        QualitySample {
            tier: TierId::Silver,
            adapter_version: version,
            score,
        }
    }

    #[test]
    fn test_regression_after_window() {
        let mut m = QualityMonitor::new(0.5, 3, 0.1);
        for _ in 0..5 {
            m.observe(sample(Some(0), 1.0));
        }
        m.watch(TierId::Silver, &adapter(1));
        assert_eq!(m.status(TierId::Silver).unwrap().baseline, 1.0);

        assert_eq!(m.observe(sample(Some(1), 0.0)), Verdict::Watching);
        // Samples from other versions do not count toward the window.
        assert_eq!(m.observe(sample(None, 1.0)), Verdict::Watching);
        assert_eq!(m.observe(sample(Some(1), 0.0)), Verdict::Watching);
        assert!(matches!(
            m.observe(sample(Some(1), 0.0)),
            Verdict::Regressed { .. }
        ));
        assert!(m.status(TierId::Silver).is_none());
    }

    #[test]
    fn test_healthy_adapter_passes() {
        let mut m = QualityMonitor::new(0.2, 2, 0.05);
        m.watch(TierId::Silver, &adapter(2));
        m.observe(sample(Some(2), 1.0));
        assert_eq!(
            m.observe(sample(Some(2), 1.0)),
            Verdict::Passed { observed: 1.0 }
        );
    }

    #[test]
    fn test_idle_without_watch() {
        let mut m = QualityMonitor::new(0.2, 2, 0.05);
        assert_eq!(m.observe(sample(Some(0), 1.0)), Verdict::Idle);
    }
}
