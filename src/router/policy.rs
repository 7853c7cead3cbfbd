//! Tier selection and fallback ladder.
//!
//! Pure functions over registry state, so the rules are testable without
//! any backend.

use crate::registry::descriptor::{HealthState, TierId};
use crate::router::envelope::SlaClass;

/// What the policy needs to know about a tier at decision time.
#[derive(Debug, Clone, Copy)]
pub struct TierView {
    pub health: HealthState,
    pub queue_depth: usize,
    pub threshold: usize,
}

impl TierView {
    pub fn saturated(&self) -> bool {
        self.queue_depth > self.threshold
    }
}

/// Why a rung was passed over.
#[derive(Debug, Clone, PartialEq)]
pub enum Skip {
    Unhealthy(HealthState),
    Saturated { queue_depth: usize, threshold: usize },
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Skip::Unhealthy(state) => write!(f, "{state}"),
            Skip::Saturated {
                queue_depth,
                threshold,
            } => write!(f, "saturated ({queue_depth} > {threshold})"),
        }
    }
}

/// Ordered tiers to try for a request, with the tier the class prefers.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    pub preferred: TierId,
    pub ladder: Vec<TierId>,
}

impl RoutePlan {
    /// Whether a response from `tier` counts as a fallback from the preferred tier.
    pub fn is_fallback(&self, tier: TierId) -> bool {
        tier.level() > self.preferred.level()
    }
}

/// Build the ladder for an SLA class.
///
/// - realtime: Gold, then Silver. Never Bronze.
/// - interactive: Silver, then Bronze; Gold goes first when it holds warm
///   state for the entity and is healthy and unsaturated.
/// - async: Bronze only.
pub fn plan(sla_class: SlaClass, warm_gold: Option<TierView>) -> RoutePlan {
    match sla_class {
        SlaClass::Realtime => RoutePlan {
            preferred: TierId::Gold,
            ladder: vec![TierId::Gold, TierId::Silver],
        },
        SlaClass::Interactive => {
            let gold_first = warm_gold
                .map(|g| g.health.is_healthy() && !g.saturated())
                .unwrap_or(false);
            let mut ladder = Vec::with_capacity(3);
            if gold_first {
                ladder.push(TierId::Gold);
            }
            ladder.extend([TierId::Silver, TierId::Bronze]);
            RoutePlan {
                preferred: TierId::Silver,
                ladder,
            }
        }
        SlaClass::Async => RoutePlan {
            preferred: TierId::Bronze,
            ladder: vec![TierId::Bronze],
        },
    }
}

/// Whether to attempt a rung. Non-final rungs must be healthy and within
/// their queue threshold; the final rung is tried unless unavailable.
pub fn admit(view: TierView, is_last: bool) -> Result<(), Skip> {
    match view.health {
        HealthState::Unavailable => Err(Skip::Unhealthy(view.health)),
        HealthState::Degraded if !is_last => Err(Skip::Unhealthy(view.health)),
        _ if !is_last && view.saturated() => Err(Skip::Saturated {
            queue_depth: view.queue_depth,
            threshold: view.threshold,
        }),
        _ => Ok(()),
    }
}
