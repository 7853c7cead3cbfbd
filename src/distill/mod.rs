//! Offline distillation: traces in, validated adapters out.

pub mod adapter;
pub mod monitor;
pub mod pipeline;
pub mod trace;

pub use pipeline::{DistillationError, DistillationPipeline, DistillationReport, PromotionOutcome};
