//! Periodic health evaluation.
//!
//! Derives each tier's `HealthState` from its load:
//! - `Unavailable` after N consecutive failures, until a cooldown elapses
//! - `Degraded` (half-open) once the cooldown has passed but failures persist
//! - `Degraded` when average latency or the recent error ratio is too high
//! - `Healthy` otherwise
//!
//! A degraded tier keeps receiving a bounded number of probe requests from
//! the router, so its failure count and latency average can recover.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::TiersConfig;
use crate::registry::descriptor::{HealthState, TierId};
use crate::registry::load::TierLoad;
use crate::registry::TierRegistry;

pub struct HealthMonitor {
    registry: Arc<TierRegistry>,
    config: TiersConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<TierRegistry>, config: TiersConfig) -> Self {
        Self { registry, config }
    }

    /// Compute the state a tier's load implies.
    pub fn assess(&self, tier: TierId, load: &TierLoad, now: Instant) -> HealthState {
        // Drained on every evaluation so stale errors never outlive one interval.
        let error_ratio = load.take_window_error_ratio();
        let failures = load.consecutive_failures();
        if failures >= self.config.unavailable_after_failures {
            let cooled = load
                .last_failure()
                .map(|at| now.duration_since(at) >= self.config.recovery_cooldown())
                .unwrap_or(true);
            return if cooled {
                HealthState::Degraded
            } else {
                HealthState::Unavailable
            };
        }

        let budget = self.config.tier(tier).latency_budget();
        let latency_limit = budget.mul_f64(self.config.degraded_latency_factor);
        if load.avg_latency() > latency_limit {
            return HealthState::Degraded;
        }

        match error_ratio {
            Some(ratio) if ratio > self.config.degraded_error_ratio => HealthState::Degraded,
            _ => HealthState::Healthy,
        }
    }

    /// Evaluate every tier once and publish changes to the registry.
    pub fn evaluate(&self) {
        let now = Instant::now();
        for tier in TierId::ALL {
            let state = self.assess(tier, self.registry.load(tier), now);
            if self.registry.set_health(tier, state) {
                debug!(tier = %tier, state = %state, "Health updated");
            }
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval());
        info!(
            interval_ms = self.config.health_check_interval_ms,
            "Health monitor started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => self.evaluate(),
                _ = shutdown.changed() => break,
            }
        }
        info!("Health monitor stopped");
    }
}
