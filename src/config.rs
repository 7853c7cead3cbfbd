//! Runtime configuration for tier-router.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section carries defaults, so a partial file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::registry::descriptor::TierId;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tier-router", about = "Latency-tiered inference routing server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tiers: TiersConfig,
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub speculative: SpeculativeConfig,
    pub predictor: PredictorConfig,
    pub jobs: JobConfig,
    pub distillation: DistillationConfig,
    pub guardrail: GuardrailConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrent HTTP requests.
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 1024,
        }
    }
}

/// Static description of one serving tier.
///
/// A tier given in a config file must be spelled out in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Display name.
    pub name: String,

    /// Latency budget in milliseconds.
    pub latency_budget_ms: u64,

    /// Concurrent requests the tier accepts before it counts as saturated.
    pub capacity: usize,

    /// Base model the tier's adapters are trained on.
    pub base_model: String,

    /// Artificial latency added by the synthetic backend.
    pub simulated_latency_ms: u64,

    /// Tokens generated per request.
    pub max_tokens: usize,
}

impl TierConfig {
    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_latency_ms)
    }
}

impl TierConfig {
    pub fn gold() -> Self {
        Self {
            name: "gold".to_string(),
            latency_budget_ms: 16,
            capacity: 64,
            base_model: "npc-small".to_string(),
            simulated_latency_ms: 1,
            max_tokens: 24,
        }
    }

    pub fn silver() -> Self {
        Self {
            name: "silver".to_string(),
            latency_budget_ms: 150,
            capacity: 128,
            base_model: "npc-medium".to_string(),
            simulated_latency_ms: 20,
            max_tokens: 64,
        }
    }

    pub fn bronze() -> Self {
        Self {
            name: "bronze".to_string(),
            latency_budget_ms: 120_000,
            capacity: 16,
            base_model: "npc-large".to_string(),
            simulated_latency_ms: 500,
            max_tokens: 256,
        }
    }
}

/// Tier definitions and health-check tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub gold: TierConfig,
    pub silver: TierConfig,
    pub bronze: TierConfig,

    /// Interval between health evaluations.
    pub health_check_interval_ms: u64,

    /// A tier is degraded when its average latency exceeds budget × this factor.
    pub degraded_latency_factor: f64,

    /// A tier is degraded when its recent error ratio exceeds this fraction.
    pub degraded_error_ratio: f64,

    /// Consecutive failures after which a tier is marked unavailable.
    pub unavailable_after_failures: u32,

    /// Time an unavailable tier waits before it is probed again (half-open).
    pub recovery_cooldown_ms: u64,

    /// Concurrent probe requests a monitor-degraded tier still receives when
    /// it is not the last rung. Successful probes are how it recovers.
    pub half_open_max_probes: u32,

    /// Smoothing factor for the latency moving average.
    pub latency_ema_alpha: f64,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            gold: TierConfig::gold(),
            silver: TierConfig::silver(),
            bronze: TierConfig::bronze(),
            health_check_interval_ms: 1000,
            degraded_latency_factor: 1.5,
            degraded_error_ratio: 0.25,
            unavailable_after_failures: 5,
            recovery_cooldown_ms: 10_000,
            half_open_max_probes: 1,
            latency_ema_alpha: 0.2,
        }
    }
}

impl TiersConfig {
    pub fn tier(&self, id: TierId) -> &TierConfig {
        match id {
            TierId::Gold => &self.gold,
            TierId::Silver => &self.silver,
            TierId::Bronze => &self.bronze,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_millis(self.recovery_cooldown_ms)
    }
}

/// Router policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Queue depth above which the router skips a tier (0 = use tier capacity).
    pub queue_depth_threshold: usize,

    /// Time reserved at the end of a deadline for the fallback decision itself.
    pub fallback_overhead_ms: u64,

    /// Safe response returned when every tier is exhausted.
    pub default_response: String,

    /// Routing decisions retained for replay.
    pub decision_log_capacity: usize,

    /// Deadline applied when a request carries none.
    pub default_deadline_ms: u64,
}

impl RouterConfig {
    pub fn fallback_overhead(&self) -> Duration {
        Duration::from_millis(self.fallback_overhead_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_depth_threshold: 0,
            fallback_overhead_ms: 5,
            default_response: "...".to_string(),
            decision_log_capacity: 4096,
            default_deadline_ms: 200,
        }
    }
}

/// KV cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Aggregate bytes of per-entity decode state before LRU eviction kicks in.
    pub capacity_bytes: usize,

    /// Maximum number of shared prefixes.
    pub prefix_capacity: usize,

    /// Tokens of decode state retained per entity.
    pub context_window_tokens: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024, // 256 MB
            prefix_capacity: 1024,
            context_window_tokens: 2048,
        }
    }
}

/// Speculative decoding settings (Gold tier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Tokens proposed by the draft model per verification round (K).
    pub lookahead: usize,

    /// Vocabulary size of the synthetic models.
    pub vocab_size: usize,

    /// Sampling temperature of the synthetic models.
    pub temperature: f64,

    /// How far the draft model's logits deviate from the target's.
    pub draft_perturbation: f64,

    /// Cost of one draft step relative to one target forward pass.
    pub draft_cost_ratio: f64,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            lookahead: 4,
            vocab_size: 512,
            temperature: 0.8,
            draft_perturbation: 0.3,
            draft_cost_ratio: 0.1,
        }
    }
}

/// State predictor settings (Silver tier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub enabled: bool,

    /// Lifetime of a prediction.
    pub ttl_ms: u64,

    /// Minimum token-set similarity for a prediction to match a real request.
    pub similarity_threshold: f64,

    /// Predictions below this confidence are not precomputed.
    pub min_confidence: f64,

    /// Pending prediction tasks; new tasks are dropped when full.
    pub queue_capacity: usize,

    /// How often expired predictions are swept.
    pub sweep_interval_ms: u64,
}

impl PredictorConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 5000,
            similarity_threshold: 0.8,
            min_confidence: 0.3,
            queue_capacity: 256,
            sweep_interval_ms: 1000,
        }
    }
}

/// Async job settings (Bronze tier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Wall-clock limit measured from submission.
    pub max_wall_clock_ms: u64,

    /// Jobs executing at once.
    pub max_concurrent_jobs: usize,

    /// How long terminal jobs (and their dedupe keys) are retained.
    pub retention_secs: u64,
}

impl JobConfig {
    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_wall_clock_ms: 10 * 60 * 1000,
            max_concurrent_jobs: 8,
            retention_secs: 24 * 3600,
        }
    }
}

/// Nightly distillation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillationConfig {
    pub enabled: bool,

    /// Interval between runs (nightly by default).
    pub interval_secs: u64,

    /// Traces below this quality are ignored.
    pub quality_threshold: f64,

    /// A candidate may score at most this much below the deployed adapter.
    pub epsilon: f64,

    /// Runs with fewer usable traces are skipped.
    pub min_traces: usize,

    /// Fraction of traces held out for evaluation.
    pub holdout_fraction: f64,

    /// Recent routed prompts replayed as the regression suite.
    pub regression_window: usize,

    /// Tiers that receive distilled adapters.
    pub targets: Vec<TierId>,

    /// Directory for archived trace segments (disabled when unset).
    pub archive_dir: Option<PathBuf>,

    /// zstd compression level for archived segments (1-22).
    pub zstd_level: i32,

    /// Live quality samples observed after a promotion before regression is judged.
    pub monitor_window: usize,

    /// Smoothing factor for live quality.
    pub monitor_ema_alpha: f64,
}

impl DistillationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 3600,
            quality_threshold: 0.7,
            epsilon: 0.02,
            min_traces: 32,
            holdout_fraction: 0.2,
            regression_window: 256,
            targets: vec![TierId::Silver, TierId::Gold],
            archive_dir: None,
            zstd_level: 3,
            monitor_window: 200,
            monitor_ema_alpha: 0.05,
        }
    }
}

/// Output policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Case-insensitive terms that must never reach a caller.
    pub blocked_terms: Vec<String>,

    /// Responses longer than this are rejected.
    pub max_chars: usize,

    /// Substituted for any violating response.
    pub fallback_response: String,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            blocked_terms: Vec::new(),
            max_chars: 8192,
            fallback_response: "The character pauses, lost in thought.".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the router misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.speculative.lookahead == 0 {
            anyhow::bail!("speculative.lookahead must be > 0");
        }
        if self.speculative.vocab_size < 2 {
            anyhow::bail!("speculative.vocab_size must be >= 2");
        }
        if self.distillation.epsilon < 0.0 {
            anyhow::bail!("distillation.epsilon must be >= 0");
        }
        if !(0.0..1.0).contains(&self.distillation.holdout_fraction) {
            anyhow::bail!("distillation.holdout_fraction must be in [0, 1)");
        }
        if self.jobs.max_concurrent_jobs == 0 {
            anyhow::bail!("jobs.max_concurrent_jobs must be > 0");
        }
        for id in TierId::ALL {
            if self.tiers.tier(id).capacity == 0 {
                anyhow::bail!("tier {id} capacity must be > 0");
            }
        }
        Ok(())
    }

    /// Queue depth above which the router treats `tier` as saturated.
    pub fn queue_threshold(&self, tier: TierId) -> usize {
        if self.router.queue_depth_threshold > 0 {
            self.router.queue_depth_threshold
        } else {
            self.tiers.tier(tier).capacity
        }
    }
}
