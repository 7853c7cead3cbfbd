//! Tier identities, health states and the descriptors the registry publishes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies a serving tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    /// Single-digit to low double-digit milliseconds, speculative decoding.
    Gold,
    /// Tens to low hundreds of milliseconds, predictive precompute.
    Silver,
    /// Seconds to minutes, asynchronous jobs.
    Bronze,
}

impl TierId {
    pub const ALL: [TierId; 3] = [TierId::Gold, TierId::Silver, TierId::Bronze];

    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            TierId::Gold => 0,
            TierId::Silver => 1,
            TierId::Bronze => 2,
        }
    }

    /// Returns the next slower tier on the fallback ladder, or None if already slowest.
    pub fn fallback(&self) -> Option<TierId> {
        match self {
            TierId::Gold => Some(TierId::Silver),
            TierId::Silver => Some(TierId::Bronze),
            TierId::Bronze => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TierId::Gold => "gold",
            TierId::Silver => "silver",
            TierId::Bronze => "bronze",
        }
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TierId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gold" => Ok(TierId::Gold),
            "silver" => Ok(TierId::Silver),
            "bronze" => Ok(TierId::Bronze),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Health of a tier as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Adapter descriptor consumed by tier clients at reload time.
///
/// This is the only channel through which distillation affects live serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRef {
    pub id: String,
    pub base_model: String,
    pub version: u64,
    pub validation_score: f64,
}

impl AdapterRef {
    /// The adapter a tier serves before any distillation has run.
    pub fn baseline(base_model: &str) -> Self {
        Self {
            id: format!("{base_model}-base"),
            base_model: base_model.to_string(),
            version: 0,
            validation_score: 0.0,
        }
    }
}

/// Descriptor of one tier inside a registry snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TierDescriptor {
    pub id: TierId,
    pub name: String,
    #[serde(with = "duration_ms")]
    pub latency_budget: Duration,
    pub model_ref: AdapterRef,
    pub capacity: usize,
    pub health_state: HealthState,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert_eq!(TierId::Gold.level(), 0);
        assert_eq!(TierId::Bronze.level(), 2);
        assert!(TierId::Gold < TierId::Bronze);
    }

    #[test]
    fn test_fallback_ladder() {
        assert_eq!(TierId::Gold.fallback(), Some(TierId::Silver));
        assert_eq!(TierId::Silver.fallback(), Some(TierId::Bronze));
        assert_eq!(TierId::Bronze.fallback(), None);
    }

    #[test]
    fn test_parse_tier() {
        assert_eq!("Gold".parse::<TierId>(), Ok(TierId::Gold));
        assert!("platinum".parse::<TierId>().is_err());
    }

    #[test]
    fn test_health_serializes_lowercase() {
        let json = serde_json::to_string(&HealthState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
