//! Serving error taxonomy.

use thiserror::Error;

use crate::registry::descriptor::TierId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServingError {
    #[error("Tier {0} is unavailable")]
    TierUnavailable(TierId),

    #[error("Deadline exceeded{}", on_tier(.tier))]
    Timeout { tier: Option<TierId> },

    #[error("Guardrail violation ({rule}) on tier {tier}")]
    GuardrailViolation { tier: TierId, rule: String },

    #[error("Job {job_id} failed after {attempts} attempts: {reason}")]
    JobFailed {
        job_id: String,
        attempts: u32,
        reason: String,
        retry_after_ms: u64,
    },

    #[error("Job {job_id} exceeded its wall-clock limit")]
    JobTimedOut { job_id: String, retry_after_ms: u64 },

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error(
        "Adapter {adapter_id} failed validation: score {score:.4} is worse than deployed {deployed:.4} by more than {epsilon}"
    )]
    ValidationFailed {
        adapter_id: String,
        score: f64,
        deployed: f64,
        epsilon: f64,
    },

    #[error("All tiers exhausted (attempted: {attempted:?})")]
    AllTiersExhausted { attempted: Vec<TierId> },

    #[error("Backend error on tier {tier}: {message}")]
    Backend { tier: TierId, message: String },
}

fn on_tier(tier: &Option<TierId>) -> String {
    tier.map(|t| format!(" on tier {t}")).unwrap_or_default()
}

impl ServingError {
    /// Whether the router may fall back to the next tier after this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            ServingError::TierUnavailable(_)
                | ServingError::Timeout { .. }
                | ServingError::Backend { .. }
        )
    }

    /// Short machine-readable code for API payloads and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            ServingError::TierUnavailable(_) => "tier_unavailable",
            ServingError::Timeout { .. } => "timeout",
            ServingError::GuardrailViolation { .. } => "guardrail_violation",
            ServingError::JobFailed { .. } => "job_failed",
            ServingError::JobTimedOut { .. } => "job_timed_out",
            ServingError::JobNotFound(_) => "job_not_found",
            ServingError::ValidationFailed { .. } => "validation_failed",
            ServingError::AllTiersExhausted { .. } => "all_tiers_exhausted",
            ServingError::Backend { .. } => "backend_error",
        }
    }
}
