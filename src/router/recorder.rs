//! Routing decision log.
//!
//! The router hands each decision to a bounded channel with `try_send`; a
//! background task drains it into a ring buffer. The distillation pipeline
//! replays recent prompts from the ring as its regression suite.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::registry::descriptor::TierId;
use crate::router::envelope::SlaClass;

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub request_id: String,
    pub entity_id: String,
    pub sla_class: SlaClass,
    pub prompt: String,
    pub preferred: TierId,
    pub tier_used: Option<TierId>,
    /// Tiers passed over or failed, with the reason.
    pub fallbacks: Vec<(TierId, String)>,
    pub degraded: bool,
    pub latency_ms: f64,
    pub outcome: String,
    pub timestamp: u64,
}

/// Bounded ring of recent decisions.
pub struct DecisionLog {
    ring: Mutex<VecDeque<DecisionRecord>>,
    capacity: usize,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: DecisionRecord) {
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Up to `n` most recent decisions, oldest first.
    pub fn recent(&self, n: usize) -> Vec<DecisionRecord> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Prompts of up to `n` recent decisions that a tier served.
    pub fn recent_prompts(&self, n: usize) -> Vec<String> {
        let ring = self.ring.lock();
        let served = ring.iter().filter(|r| r.tier_used.is_some());
        let count = served.clone().count();
        served
            .skip(count.saturating_sub(n))
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live-path handle: never blocks.
pub struct DecisionRecorder {
    tx: mpsc::Sender<DecisionRecord>,
    log: Arc<DecisionLog>,
    dropped: AtomicU64,
}

/// Drains recorded decisions into the log.
pub struct RecorderWorker {
    rx: mpsc::Receiver<DecisionRecord>,
    log: Arc<DecisionLog>,
}

impl DecisionRecorder {
    pub fn new(capacity: usize) -> (Self, RecorderWorker) {
        let (tx, rx) = mpsc::channel(capacity.clamp(1, 4096));
        let log = Arc::new(DecisionLog::new(capacity));
        (
            Self {
                tx,
                log: Arc::clone(&log),
                dropped: AtomicU64::new(0),
            },
            RecorderWorker { rx, log },
        )
    }

    pub fn record(&self, record: DecisionRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn log(&self) -> &Arc<DecisionLog> {
        &self.log
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RecorderWorker {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                record = self.rx.recv() => match record {
                    Some(record) => self.log.push(record),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(recorded = self.log.len(), "Decision recorder stopped");
    }
}
