//! Tier Registry: the shared, versioned view of the three serving tiers.
//!
//! - [`descriptor`]: TierId, HealthState, TierDescriptor, AdapterRef
//! - [`load`]: lock-free queue depth / latency accounting per tier
//! - [`health`]: periodic health evaluation loop
//!
//! Readers take an `Arc<RegistrySnapshot>` and never observe a partially
//! updated descriptor. Writers build a new snapshot and swap the pointer.

pub mod descriptor;
pub mod health;
pub mod load;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::TiersConfig;
use crate::events::{EventBus, EventKind};
use descriptor::{AdapterRef, HealthState, TierDescriptor, TierId};
use load::TierLoad;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Tier {tier} model_ref changed concurrently: expected version {expected}, found {found}")]
    VersionConflict {
        tier: TierId,
        expected: u64,
        found: u64,
    },
}

/// Immutable view of all tiers at one registry version.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub version: u64,
    tiers: [TierDescriptor; 3],
}

impl RegistrySnapshot {
    pub fn tier(&self, id: TierId) -> &TierDescriptor {
        &self.tiers[id.level() as usize]
    }

    pub fn tiers(&self) -> &[TierDescriptor] {
        &self.tiers
    }
}

/// Health endpoint payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub queue_depth: usize,
    pub avg_latency_ms: f64,
}

pub struct TierRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    loads: [Arc<TierLoad>; 3],
    overrides: Mutex<[Option<HealthState>; 3]>,
    events: Arc<EventBus>,
}

impl TierRegistry {
    pub fn from_config(config: &TiersConfig, events: Arc<EventBus>) -> Self {
        let describe = |id: TierId| {
            let tier = config.tier(id);
            TierDescriptor {
                id,
                name: tier.name.clone(),
                latency_budget: tier.latency_budget(),
                model_ref: AdapterRef::baseline(&tier.base_model),
                capacity: tier.capacity,
                health_state: HealthState::Healthy,
            }
        };
        let load = || Arc::new(TierLoad::new(config.latency_ema_alpha));

        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot {
                version: 0,
                tiers: [
                    describe(TierId::Gold),
                    describe(TierId::Silver),
                    describe(TierId::Bronze),
                ],
            })),
            loads: [load(), load(), load()],
            overrides: Mutex::new([None; 3]),
            events,
        }
    }

    /// The current snapshot. Cheap: one pointer clone under a read lock.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn descriptor(&self, tier: TierId) -> TierDescriptor {
        self.snapshot().tier(tier).clone()
    }

    pub fn health(&self, tier: TierId) -> HealthState {
        self.snapshot().tier(tier).health_state
    }

    pub fn model_ref(&self, tier: TierId) -> AdapterRef {
        self.snapshot().tier(tier).model_ref.clone()
    }

    pub fn load(&self, tier: TierId) -> &Arc<TierLoad> {
        &self.loads[tier.level() as usize]
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn health_report(&self, tier: TierId) -> HealthReport {
        let load = self.load(tier).snapshot();
        HealthReport {
            status: self.health(tier),
            queue_depth: load.queue_depth,
            avg_latency_ms: load.avg_latency_ms,
        }
    }

    /// Build a new snapshot from the current one and swap it in.
    fn update<R>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> R) -> R {
        let mut current = self.current.write();
        let mut next = RegistrySnapshot::clone(&current);
        let out = f(&mut next);
        next.version = current.version + 1;
        *current = Arc::new(next);
        out
    }

    /// Apply a health state computed by the monitor. Ignored while an override is set.
    pub fn set_health(&self, tier: TierId, state: HealthState) -> bool {
        if self.overrides.lock()[tier.level() as usize].is_some() {
            return false;
        }
        self.apply_health(tier, state)
    }

    pub fn is_overridden(&self, tier: TierId) -> bool {
        self.overrides.lock()[tier.level() as usize].is_some()
    }

    /// Pin a tier's health (`Some`) or hand it back to the monitor (`None`).
    pub fn override_health(&self, tier: TierId, state: Option<HealthState>) {
        self.overrides.lock()[tier.level() as usize] = state;
        match state {
            Some(state) => {
                info!(tier = %tier, state = %state, "Health override set");
                self.apply_health(tier, state);
            }
            None => info!(tier = %tier, "Health override cleared"),
        }
    }

    fn apply_health(&self, tier: TierId, state: HealthState) -> bool {
        if self.health(tier) == state {
            return false;
        }
        let previous = self.update(|snap| {
            let desc = &mut snap.tiers[tier.level() as usize];
            std::mem::replace(&mut desc.health_state, state)
        });
        if previous == state {
            return false;
        }

        debug!(tier = %tier, from = %previous, to = %state, "Tier health changed");
        let kind = if state.is_healthy() {
            EventKind::TierRecovered
        } else {
            EventKind::TierDegraded
        };
        self.events
            .emit(kind, Some(tier), format!("{previous} -> {state}"));
        true
    }

    /// Atomically replace a tier's adapter if it is still at `expected_version`.
    ///
    /// Returns the new registry version.
    pub fn swap_model_ref(
        &self,
        tier: TierId,
        expected_version: u64,
        adapter: AdapterRef,
    ) -> Result<u64, RegistryError> {
        let mut current = self.current.write();
        let found = current.tier(tier).model_ref.version;
        if found != expected_version {
            return Err(RegistryError::VersionConflict {
                tier,
                expected: expected_version,
                found,
            });
        }
        let mut next = RegistrySnapshot::clone(&current);
        next.tiers[tier.level() as usize].model_ref = adapter;
        next.version = current.version + 1;
        let version = next.version;
        *current = Arc::new(next);
        Ok(version)
    }
}
