//! Request and response envelopes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::registry::descriptor::TierId;

/// A request's declared latency/quality class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaClass {
    Realtime,
    Interactive,
    Async,
}

impl SlaClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlaClass::Realtime => "realtime",
            SlaClass::Interactive => "interactive",
            SlaClass::Async => "async",
        }
    }
}

impl std::fmt::Display for SlaClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the NPC is being asked to continue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    /// Constant system-prompt segment shared across entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    pub prompt: String,

    /// Recent conversation turns, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<String>,
}

impl GenerationContext {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.history = history;
        self
    }

    /// History and prompt as one text, without the system segment.
    pub fn conversation(&self) -> String {
        let mut parts: Vec<&str> = self.history.iter().map(String::as_str).collect();
        parts.push(&self.prompt);
        parts.join(" ")
    }
}

/// An inbound request. Immutable once built.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub id: String,
    pub entity_id: String,
    pub sla_class: SlaClass,
    pub context: GenerationContext,
    pub deadline: Instant,
    pub priority: u8,
}

impl RequestEnvelope {
    /// Build a request whose deadline is `budget` from now.
    pub fn new(
        entity_id: impl Into<String>,
        sla_class: SlaClass,
        context: GenerationContext,
        budget: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            sla_class,
            context,
            deadline: Instant::now() + budget,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// JSON body of `POST /v1/route`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRequest {
    pub entity_id: String,
    pub sla_class: SlaClass,
    pub context: GenerationContext,
    /// Budget relative to receipt; the configured default when absent.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl RouteRequest {
    pub fn into_envelope(self, default_deadline: Duration) -> RequestEnvelope {
        let budget = self
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(default_deadline);
        RequestEnvelope::new(self.entity_id, self.sla_class, self.context, budget)
            .with_priority(self.priority.unwrap_or(0))
    }
}

/// Where a response's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Decoded by the tier's model.
    Model,
    /// Served from a precomputed prediction.
    Prediction,
    /// Accepted as an async job; poll `job_id` for the result.
    Job,
    /// Policy-defined safe default.
    Default,
    /// Guardrail substituted the fallback content.
    Guardrail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub entity_id: String,
    pub content: String,
    pub tier_used: Option<TierId>,
    pub degraded: bool,
    pub source: ResponseSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_request_parses_and_defaults_deadline() {
        let body = r#"{"entity_id":"npc-7","sla_class":"realtime","context":{"prompt":"hi"}}"#;
        let req: RouteRequest = serde_json::from_str(body).unwrap();
        let env = req.into_envelope(Duration::from_millis(200));
        assert_eq!(env.sla_class, SlaClass::Realtime);
        assert!(env.remaining() <= Duration::from_millis(200));
        assert!(env.remaining() > Duration::from_millis(100));
    }

    #[test]
    fn test_conversation_joins_history() {
        let ctx = GenerationContext::prompt("and you?")
            .with_system("You are a guard.")
            .with_history(vec!["hello".into(), "well met".into()]);
        assert_eq!(ctx.conversation(), "hello well met and you?");
    }

    #[test]
    fn test_response_serializes_tier_lowercase() {
        let resp = ResponseEnvelope {
            request_id: "r".into(),
            entity_id: "e".into(),
            content: "c".into(),
            tier_used: Some(TierId::Gold),
            degraded: false,
            source: ResponseSource::Model,
            job_id: None,
            latency_ms: 1.0,
            error: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["tier_used"], "gold");
        assert!(json.get("job_id").is_none());
    }
}
