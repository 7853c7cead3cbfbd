//! tier-router: latency-tiered inference routing.
//!
//! Requests are routed by SLA class across three serving tiers:
//!   Gold (speculative decoding, single-digit ms) → Silver (predictive
//!   precompute, tens of ms) → Bronze (async jobs, seconds to minutes)
//!
//! Bronze results are harvested nightly and distilled into adapters that are
//! hot-swapped into Silver and Gold.

pub mod app;
pub mod cache;
pub mod config;
pub mod distill;
pub mod error;
pub mod events;
pub mod guardrail;
pub mod inference;
pub mod jobs;
pub mod metrics;
pub mod predictor;
pub mod registry;
pub mod router;
pub mod server;
pub mod tiers;

pub use app::ServingStack;
pub use config::Config;
pub use error::ServingError;
pub use router::Router;
