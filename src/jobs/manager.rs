//! Async job manager for the Bronze tier.
//!
//! Submission is idempotent per dedupe key. Each job runs on its own task:
//! it waits for an execution permit, retries failed attempts with exponential
//! backoff and is cut off at its wall-clock limit measured from submission.
//! Status changes are published on a per-job `watch` channel.
//!
//! Successful output passes the guardrail before it is stored. A violating
//! result is replaced by the fallback and never becomes a distillation trace.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::distill::trace::{DistillationTrace, TraceStore};
use crate::error::ServingError;
use crate::guardrail::GuardrailFilter;
use crate::jobs::job::{AsyncJob, JobStatus};
use crate::metrics::Metrics;
use crate::registry::descriptor::TierId;

#[derive(Debug, Clone)]
pub struct JobOutput {
    pub content: String,
    pub quality_score: f64,
}

/// Runs one attempt of a job's generation.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, prompt: &str) -> anyhow::Result<JobOutput>;
}

/// Result of [`JobManager::retrieve`] for a job that has not failed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    InProgress(JobStatus),
    Succeeded(String),
}

struct JobHandle {
    record: Mutex<AsyncJob>,
    prompt: String,
    result: Mutex<Option<String>>,
    status_tx: watch::Sender<JobStatus>,
    submitted: Instant,
}

impl JobHandle {
    fn job_id(&self) -> String {
        self.record.lock().job_id.clone()
    }

    fn dedupe_key(&self) -> String {
        self.record.lock().dedupe_key.clone()
    }

    fn transition(&self, next: JobStatus) -> bool {
        let mut record = self.record.lock();
        let moved = record.transition(next);
        if moved {
            self.status_tx.send_replace(next);
        }
        moved
    }

    fn fail(&self, reason: String) -> bool {
        let mut record = self.record.lock();
        let moved = record.transition(JobStatus::Failed);
        if moved {
            record.failure_reason = Some(reason);
            self.status_tx.send_replace(JobStatus::Failed);
        }
        moved
    }
}

pub struct JobManager {
    jobs: DashMap<String, Arc<JobHandle>>,
    dedupe: DashMap<String, String>,
    executor: Arc<dyn JobExecutor>,
    permits: Semaphore,
    config: JobConfig,
    traces: Arc<TraceStore>,
    guardrail: Option<Arc<GuardrailFilter>>,
    metrics: Option<Arc<Metrics>>,
}

impl JobManager {
    pub fn new(config: JobConfig, executor: Arc<dyn JobExecutor>, traces: Arc<TraceStore>) -> Self {
        Self {
            jobs: DashMap::new(),
            dedupe: DashMap::new(),
            executor,
            permits: Semaphore::new(config.max_concurrent_jobs.max(1)),
            config,
            traces,
            guardrail: None,
            metrics: None,
        }
    }

    pub fn with_guardrail(mut self, guardrail: Arc<GuardrailFilter>) -> Self {
        self.guardrail = Some(guardrail);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.traces
    }

    /// Submit a job. A dedupe key seen before returns the existing job id
    /// without starting new work.
    pub fn submit(self: &Arc<Self>, prompt: impl Into<String>, dedupe_key: impl Into<String>) -> String {
        let dedupe_key = dedupe_key.into();
        let (job_id, handle) = match self.dedupe.entry(dedupe_key.clone()) {
            Entry::Occupied(existing) => {
                debug!(job_id = existing.get(), dedupe_key, "Duplicate submission");
                return existing.get().clone();
            }
            Entry::Vacant(slot) => {
                let job_id = Uuid::new_v4().to_string();
                let (status_tx, _) = watch::channel(JobStatus::Pending);
                let handle = Arc::new(JobHandle {
                    record: Mutex::new(AsyncJob::new(job_id.clone(), dedupe_key.clone())),
                    prompt: prompt.into(),
                    result: Mutex::new(None),
                    status_tx,
                    submitted: Instant::now(),
                });
                self.jobs.insert(job_id.clone(), Arc::clone(&handle));
                slot.insert(job_id.clone());
                (job_id, handle)
            }
        };

        info!(job_id, dedupe_key, "Job submitted");
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(handle).await });
        job_id
    }

    async fn run(self: Arc<Self>, handle: Arc<JobHandle>) {
        let job_id = handle.job_id();
        let deadline = handle.submitted + self.config.max_wall_clock();

        match tokio::time::timeout_at(deadline, self.attempt_all(&handle)).await {
            Ok(Ok(output)) => {
                let rule = self.guardrail.as_ref().and_then(|g| {
                    g.screen(TierId::Bronze, &handle.dedupe_key(), &job_id, &output.content)
                        .map(|rule| (rule, g.fallback_response().to_string()))
                });
                match rule {
                    Some((rule, fallback)) => {
                        *handle.result.lock() = Some(fallback);
                        handle.record.lock().guardrail_rule = Some(rule.to_string());
                        if handle.transition(JobStatus::Succeeded) {
                            info!(job_id, rule, "Job output replaced by guardrail fallback");
                        }
                    }
                    None => {
                        *handle.result.lock() = Some(output.content.clone());
                        if handle.transition(JobStatus::Succeeded) {
                            self.traces.append(DistillationTrace::new(
                                TierId::Bronze,
                                handle.prompt.clone(),
                                output.content,
                                output.quality_score,
                            ));
                            info!(job_id, quality = output.quality_score, "Job succeeded");
                        }
                    }
                }
            }
            Ok(Err(reason)) => {
                if handle.fail(reason.clone()) {
                    warn!(job_id, reason, "Job failed after retries");
                }
            }
            Err(_) => {
                if handle.transition(JobStatus::TimedOut) {
                    warn!(
                        job_id,
                        limit_ms = self.config.max_wall_clock_ms,
                        "Job exceeded wall-clock limit"
                    );
                }
            }
        }

        if let Some(m) = &self.metrics {
            let status = handle.record.lock().status;
            m.jobs.with_label_values(&[status.as_str()]).inc();
        }
    }

    async fn attempt_all(&self, handle: &JobHandle) -> Result<JobOutput, String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| "job manager closed".to_string())?;
        handle.transition(JobStatus::Running);

        let mut attempt = 0;
        loop {
            attempt += 1;
            handle.record.lock().attempts = attempt;
            match self.executor.execute(&handle.prompt).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt > self.config.max_retries => return Err(e.to_string()),
                Err(e) => {
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        job_id = handle.job_id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Job attempt failed: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Current record for a job. Never blocks on the job's progress.
    pub fn poll(&self, job_id: &str) -> Option<AsyncJob> {
        self.jobs.get(job_id).map(|h| h.record.lock().clone())
    }

    /// The job's result, its current status if still running, or its failure
    /// with retry guidance.
    pub fn retrieve(&self, job_id: &str) -> Result<JobOutcome, ServingError> {
        let handle = self
            .jobs
            .get(job_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ServingError::JobNotFound(job_id.to_string()))?;
        let record = handle.record.lock().clone();

        match record.status {
            JobStatus::Succeeded => Ok(JobOutcome::Succeeded(
                handle.result.lock().clone().unwrap_or_default(),
            )),
            JobStatus::Failed => Err(ServingError::JobFailed {
                job_id: record.job_id,
                attempts: record.attempts,
                reason: record.failure_reason.unwrap_or_default(),
                retry_after_ms: self.config.backoff(record.attempts).as_millis() as u64,
            }),
            JobStatus::TimedOut => Err(ServingError::JobTimedOut {
                job_id: record.job_id,
                retry_after_ms: self.config.initial_backoff_ms,
            }),
            status => Ok(JobOutcome::InProgress(status)),
        }
    }

    /// Status updates for a job, starting with its current status.
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<JobStatus>> {
        self.jobs.get(job_id).map(|h| h.status_tx.subscribe())
    }

    /// Wait until the job is terminal or `deadline` passes; returns the status at that point.
    pub async fn wait(&self, job_id: &str, deadline: Instant) -> Result<JobStatus, ServingError> {
        let mut rx = self
            .subscribe(job_id)
            .ok_or_else(|| ServingError::JobNotFound(job_id.to_string()))?;

        let waited = tokio::time::timeout_at(deadline, rx.wait_for(|s| s.is_terminal()))
            .await
            .map(|r| r.map(|status| *status));
        match waited {
            Ok(Ok(status)) => Ok(status),
            // The sender lives as long as the job; a closed channel means it was pruned.
            Ok(Err(_)) => Err(ServingError::JobNotFound(job_id.to_string())),
            Err(_) => Ok(*rx.borrow()),
        }
    }

    /// Drop terminal jobs that finished more than `retention` ago, along with
    /// their dedupe keys. Returns the number pruned.
    pub fn prune_terminal(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut pruned = Vec::new();
        self.jobs.retain(|job_id, handle| {
            let record = handle.record.lock();
            let expired = record
                .finished_at
                .map(|at| now.saturating_duration_since(at) >= retention)
                .unwrap_or(false);
            if expired {
                pruned.push((job_id.clone(), record.dedupe_key.clone()));
            }
            !expired
        });

        for (job_id, key) in &pruned {
            self.dedupe.remove_if(key, |_, id| id == job_id);
        }
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "Pruned terminal jobs");
        }
        pruned.len()
    }

    /// Periodically prune terminal jobs until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let retention = Duration::from_secs(self.config.retention_secs);
        let period = (retention / 10).clamp(Duration::from_secs(1), Duration::from_secs(600));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prune_terminal(retention);
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakyExecutor {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobExecutor for FlakyExecutor {
        async fn execute(&self, prompt: &str) -> anyhow::Result<JobOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                anyhow::bail!("backend hiccup");
            }
            Ok(JobOutput {
                content: format!("long answer to {prompt}"),
                quality_score: 0.9,
            })
        }
    }

    fn manager(failures: u32, max_retries: u32) -> (Arc<JobManager>, Arc<FlakyExecutor>) {
        let executor = Arc::new(FlakyExecutor {
            failures_before_success: failures,
            calls: AtomicU32::new(0),
        });
        let config = JobConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        };
        let jobs = Arc::new(JobManager::new(
            config,
            executor.clone(),
            Arc::new(TraceStore::new()),
        ));
        (jobs, executor)
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_retry_then_succeed_appends_trace() {
        let (jobs, executor) = manager(2, 3);
        let id = jobs.submit("tell me a legend", "k1");
        assert_eq!(jobs.wait(&id, far()).await.unwrap(), JobStatus::Succeeded);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            jobs.retrieve(&id).unwrap(),
            JobOutcome::Succeeded("long answer to tell me a legend".into())
        );
        assert_eq!(jobs.poll(&id).unwrap().attempts, 3);
        assert_eq!(jobs.traces().len(), 1);
    }

    #[tokio::test]
    async fn test_violating_result_is_replaced_and_not_traced() {
        let events = Arc::new(crate::events::EventBus::default());
        let guardrail = Arc::new(GuardrailFilter::new(
            &crate::config::GuardrailConfig {
                blocked_terms: vec!["legend".into()],
                max_chars: 200,
                fallback_response: "The scribe is silent.".into(),
            },
            Arc::clone(&events),
        ));
        let executor = Arc::new(FlakyExecutor {
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let jobs = Arc::new(
            JobManager::new(JobConfig::default(), executor, Arc::new(TraceStore::new()))
                .with_guardrail(guardrail),
        );

        let id = jobs.submit("tell me a legend", "k-blocked");
        assert_eq!(jobs.wait(&id, far()).await.unwrap(), JobStatus::Succeeded);
        assert_eq!(
            jobs.retrieve(&id).unwrap(),
            JobOutcome::Succeeded("The scribe is silent.".into())
        );
        assert_eq!(jobs.poll(&id).unwrap().guardrail_rule.as_deref(), Some("blocked_term"));
        assert!(jobs.traces().is_empty());

        let violations = events.recent_of(crate::events::EventKind::GuardrailViolation);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].tier, Some(TierId::Bronze));
        assert!(!violations[0].detail.contains("legend"));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (jobs, executor) = manager(10, 2);
        let id = jobs.submit("p", "k");
        assert_eq!(jobs.wait(&id, far()).await.unwrap(), JobStatus::Failed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        match jobs.retrieve(&id) {
            Err(ServingError::JobFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(jobs.traces().is_empty());
    }

    #[tokio::test]
    async fn test_dedupe_returns_same_id() {
        let (jobs, executor) = manager(0, 0);
        let a = jobs.submit("p", "abc");
        let b = jobs.submit("p", "abc");
        assert_eq!(a, b);
        jobs.wait(&a, far()).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (jobs, _) = manager(0, 0);
        assert!(jobs.poll("nope").is_none());
        assert_eq!(
            jobs.retrieve("nope").unwrap_err(),
            ServingError::JobNotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn test_prune_releases_dedupe_key() {
        let (jobs, executor) = manager(0, 0);
        let first = jobs.submit("p", "k");
        jobs.wait(&first, far()).await.unwrap();

        assert_eq!(jobs.prune_terminal(Duration::ZERO), 1);
        assert!(jobs.poll(&first).is_none());

        let second = jobs.submit("p", "k");
        assert_ne!(first, second);
        jobs.wait(&second, far()).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }
}
