//! Event notifications for external observability collaborators.
//!
//! Events are broadcast to any number of subscribers (the `/events` SSE stream)
//! and the most recent ones are kept in a bounded buffer for inspection.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::registry::descriptor::TierId;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TierDegraded,
    TierRecovered,
    AdapterPromoted,
    AdapterRolledback,
    ValidationFailed,
    GuardrailViolation,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::TierDegraded => "tier_degraded",
            EventKind::TierRecovered => "tier_recovered",
            EventKind::AdapterPromoted => "adapter_promoted",
            EventKind::AdapterRolledback => "adapter_rolledback",
            EventKind::ValidationFailed => "validation_failed",
            EventKind::GuardrailViolation => "guardrail_violation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServingEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub tier: Option<TierId>,
    pub timestamp: u64,
    pub detail: String,
}

pub struct EventBus {
    tx: broadcast::Sender<ServingEvent>,
    recent: Mutex<VecDeque<ServingEvent>>,
    retain: usize,
}

impl EventBus {
    pub fn new(retain: usize) -> Self {
        let (tx, _) = broadcast::channel(retain.max(16));
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(retain)),
            retain,
        }
    }

    /// Publish an event. Never blocks; slow subscribers lag and drop events.
    pub fn emit(&self, kind: EventKind, tier: Option<TierId>, detail: impl Into<String>) {
        let event = ServingEvent {
            kind,
            tier,
            timestamp: unix_millis(),
            detail: detail.into(),
        };

        info!(
            event = %event.kind,
            tier = ?event.tier,
            detail = event.detail,
            "Serving event"
        );

        {
            let mut recent = self.recent.lock();
            if recent.len() == self.retain {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServingEvent> {
        self.tx.subscribe()
    }

    /// Recent events, oldest first.
    pub fn recent(&self) -> Vec<ServingEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Recent events of one kind.
    pub fn recent_of(&self, kind: EventKind) -> Vec<ServingEvent> {
        self.recent
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
