//! Lock-free per-tier load accounting.
//!
//! Every live request holds an [`InFlightGuard`] while it is queued on or being
//! served by a tier, so `queue_depth` is exact even when requests are cancelled.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug)]
pub struct TierLoad {
    queue_depth: AtomicUsize,
    /// EWMA latency in microseconds, stored as f64 bits.
    avg_latency_us: AtomicU64,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    consecutive_failures: AtomicU32,
    /// Requests/errors since the last health evaluation.
    window_requests: AtomicU64,
    window_errors: AtomicU64,
    last_failure: Mutex<Option<Instant>>,
    /// Half-open probes currently in flight.
    probes: AtomicU32,
    ema_alpha: f64,
}

/// Point-in-time copy of a tier's load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSnapshot {
    pub queue_depth: usize,
    pub avg_latency_ms: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub consecutive_failures: u32,
}

impl TierLoad {
    pub fn new(ema_alpha: f64) -> Self {
        Self {
            queue_depth: AtomicUsize::new(0),
            avg_latency_us: AtomicU64::new(0f64.to_bits()),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            window_requests: AtomicU64::new(0),
            window_errors: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            probes: AtomicU32::new(0),
            ema_alpha: ema_alpha.clamp(0.0, 1.0),
        }
    }

    /// Enter the tier's queue; the depth drops when the guard does.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.queue_depth.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            load: Arc::clone(self),
        }
    }

    /// Claim one of `max` half-open probe slots.
    pub fn try_probe(self: &Arc<Self>, max: u32) -> Option<ProbeGuard> {
        self.probes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ProbeGuard {
                load: Arc::clone(self),
            })
    }

    pub fn probes_in_flight(&self) -> u32 {
        self.probes.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    pub fn avg_latency(&self) -> Duration {
        let us = f64::from_bits(self.avg_latency_us.load(Ordering::Relaxed));
        Duration::from_secs_f64(us.max(0.0) / 1e6)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<Instant> {
        *self.last_failure.lock()
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.window_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.observe_latency(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.window_requests.fetch_add(1, Ordering::Relaxed);
        self.window_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.lock() = Some(Instant::now());
        self.observe_latency(latency);
    }

    fn observe_latency(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1e6;
        let alpha = self.ema_alpha;
        let _ = self
            .avg_latency_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let prev = f64::from_bits(bits);
                let next = if prev == 0.0 {
                    sample
                } else {
                    alpha * sample + (1.0 - alpha) * prev
                };
                Some(next.to_bits())
            });
    }

    /// Error ratio since the previous call; resets the window.
    pub fn take_window_error_ratio(&self) -> Option<f64> {
        let requests = self.window_requests.swap(0, Ordering::AcqRel);
        let errors = self.window_errors.swap(0, Ordering::AcqRel);
        if requests == 0 {
            None
        } else {
            Some(errors as f64 / requests as f64)
        }
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            queue_depth: self.queue_depth(),
            avg_latency_ms: self.avg_latency().as_secs_f64() * 1e3,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
        }
    }
}

/// Holds one slot of a tier's queue depth.
#[derive(Debug)]
pub struct InFlightGuard {
    load: Arc<TierLoad>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.load.queue_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds one half-open probe slot.
#[derive(Debug)]
pub struct ProbeGuard {
    load: Arc<TierLoad>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.load.probes.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_queue_depth() {
        let load = Arc::new(TierLoad::new(0.5));
        let a = load.enter();
        let b = load.enter();
        assert_eq!(load.queue_depth(), 2);
        drop(a);
        assert_eq!(load.queue_depth(), 1);
        drop(b);
        assert_eq!(load.queue_depth(), 0);
    }

    #[test]
    fn test_probe_slots_are_bounded() {
        let load = Arc::new(TierLoad::new(0.5));
        let first = load.try_probe(1).expect("first probe");
        assert!(load.try_probe(1).is_none());
        assert_eq!(load.probes_in_flight(), 1);
        drop(first);
        assert!(load.try_probe(1).is_some());
        assert!(load.try_probe(0).is_none());
    }

    #[test]
    fn test_latency_ema() {
        let load = TierLoad::new(0.5);
        load.record_success(Duration::from_millis(10));
        assert!((load.avg_latency().as_secs_f64() - 0.010).abs() < 1e-9);
        load.record_success(Duration::from_millis(20));
        assert!((load.avg_latency().as_secs_f64() - 0.015).abs() < 1e-9);
    }

    #[test]
    fn test_failures_and_window() {
        let load = TierLoad::new(0.2);
        load.record_failure(Duration::from_millis(1));
        load.record_failure(Duration::from_millis(1));
        assert_eq!(load.consecutive_failures(), 2);
        load.record_success(Duration::from_millis(1));
        assert_eq!(load.consecutive_failures(), 0);

        let ratio = load.take_window_error_ratio().unwrap();
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);
        assert!(load.take_window_error_ratio().is_none());
    }
}
