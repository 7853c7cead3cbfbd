//! Output guardrail.
//!
//! Every tier's output passes through [`GuardrailFilter::filter`] before it
//! reaches the caller. Violating content is replaced with the configured
//! fallback and never logged or forwarded; only tier, entity, trace id and
//! the rule that fired are recorded.

use std::sync::Arc;

use tracing::warn;

use crate::config::GuardrailConfig;
use crate::error::ServingError;
use crate::events::{EventBus, EventKind};
use crate::metrics::Metrics;
use crate::registry::descriptor::TierId;
use crate::router::envelope::{ResponseEnvelope, ResponseSource};

pub struct GuardrailFilter {
    blocked_terms: Vec<String>,
    max_chars: usize,
    fallback_response: String,
    events: Arc<EventBus>,
    metrics: Option<Arc<Metrics>>,
}

impl GuardrailFilter {
    pub fn new(config: &GuardrailConfig, events: Arc<EventBus>) -> Self {
        Self {
            blocked_terms: config
                .blocked_terms
                .iter()
                .map(|t| t.to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            max_chars: config.max_chars,
            fallback_response: config.fallback_response.clone(),
            events,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn fallback_response(&self) -> &str {
        &self.fallback_response
    }

    /// Name of the first rule `content` violates, if any.
    pub fn check(&self, content: &str) -> Option<&'static str> {
        if content.trim().is_empty() {
            return Some("empty_output");
        }
        if content.chars().count() > self.max_chars {
            return Some("max_length");
        }
        let lowered = content.to_lowercase();
        if self.blocked_terms.iter().any(|t| lowered.contains(t.as_str())) {
            return Some("blocked_term");
        }
        None
    }

    /// Check `content` and, on a violation, log and publish it without the
    /// content itself. Returns the rule that fired.
    pub fn screen(
        &self,
        tier: TierId,
        entity_id: &str,
        trace_id: &str,
        content: &str,
    ) -> Option<&'static str> {
        let rule = self.check(content)?;
        let violation = ServingError::GuardrailViolation {
            tier,
            rule: rule.to_string(),
        };
        warn!(tier = %tier, entity_id, trace_id, rule, "{violation}");
        self.events.emit(
            EventKind::GuardrailViolation,
            Some(tier),
            format!("entity={entity_id} trace={trace_id} rule={rule}"),
        );
        if let Some(m) = &self.metrics {
            m.guardrail_violations
                .with_label_values(&[tier.as_str()])
                .inc();
        }
        Some(rule)
    }

    /// Inspect a tier response, substituting the fallback on a violation.
    ///
    /// Policy defaults and pending async jobs carry no model output and pass through.
    pub fn filter(&self, mut envelope: ResponseEnvelope) -> ResponseEnvelope {
        let Some(tier) = envelope.tier_used else {
            return envelope;
        };
        if matches!(
            envelope.source,
            ResponseSource::Job | ResponseSource::Default | ResponseSource::Guardrail
        ) {
            return envelope;
        }
        if self
            .screen(tier, &envelope.entity_id, &envelope.request_id, &envelope.content)
            .is_none()
        {
            return envelope;
        }

        envelope.content = self.fallback_response.clone();
        envelope.source = ResponseSource::Guardrail;
        envelope.degraded = true;
        envelope
    }
}
