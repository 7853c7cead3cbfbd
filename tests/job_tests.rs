//! Integration tests for the Bronze async job manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use tier_router::config::JobConfig;
use tier_router::distill::trace::TraceStore;
use tier_router::error::ServingError;
use tier_router::jobs::{JobExecutor, JobManager, JobOutcome, JobOutput, JobStatus};

/// Counts executions; sleeps `delay` and fails the first `failures` attempts.
struct CountingExecutor {
    calls: AtomicUsize,
    failures: usize,
    delay: Duration,
}

impl CountingExecutor {
    fn new(failures: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
            delay,
        })
    }
}

#[async_trait]
impl JobExecutor for CountingExecutor {
    async fn execute(&self, prompt: &str) -> anyhow::Result<JobOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if n < self.failures {
            anyhow::bail!("backend hiccup {n}");
        }
        Ok(JobOutput {
            content: format!("chronicle of {prompt}"),
            quality_score: 0.9,
        })
    }
}

fn config() -> JobConfig {
    JobConfig {
        max_retries: 2,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        max_wall_clock_ms: 5_000,
        max_concurrent_jobs: 4,
        retention_secs: 60,
    }
}

fn manager(config: JobConfig, executor: Arc<CountingExecutor>) -> (Arc<JobManager>, Arc<TraceStore>) {
    let traces = Arc::new(TraceStore::new());
    let manager = Arc::new(JobManager::new(config, executor, Arc::clone(&traces)));
    (manager, traces)
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_submissions_share_one_job() {
    let executor = CountingExecutor::new(0, Duration::from_millis(20));
    let (manager, _) = manager(config(), Arc::clone(&executor));

    let submissions: Vec<_> = (0..16)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit("the siege of Harrowmere", "abc") })
        })
        .collect();
    let mut ids = Vec::new();
    for s in submissions {
        ids.push(s.await.unwrap());
    }

    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(manager.len(), 1);
    assert_eq!(
        manager.wait(&ids[0], soon()).await.unwrap(),
        JobStatus::Succeeded
    );
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_success_appends_trace_and_is_retrievable() {
    let executor = CountingExecutor::new(1, Duration::ZERO);
    let (manager, traces) = manager(config(), executor);

    let job_id = manager.submit("the old mill", "mill");
    assert_eq!(manager.wait(&job_id, soon()).await.unwrap(), JobStatus::Succeeded);

    let job = manager.poll(&job_id).unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.result_ref.as_deref(), Some(format!("/jobs/{job_id}/result").as_str()));
    assert_eq!(
        manager.retrieve(&job_id).unwrap(),
        JobOutcome::Succeeded("chronicle of the old mill".to_string())
    );

    let harvested = traces.since(0);
    assert_eq!(harvested.len(), 1);
    assert_eq!(harvested[0].prompt, "the old mill");
}

#[tokio::test]
async fn test_retries_exhausted_surface_failure_with_guidance() {
    let executor = CountingExecutor::new(usize::MAX, Duration::ZERO);
    let (manager, traces) = manager(config(), Arc::clone(&executor));

    let job_id = manager.submit("doomed", "doomed");
    assert_eq!(manager.wait(&job_id, soon()).await.unwrap(), JobStatus::Failed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

    match manager.retrieve(&job_id) {
        Err(ServingError::JobFailed {
            attempts,
            retry_after_ms,
            ..
        }) => {
            assert_eq!(attempts, 3);
            assert!(retry_after_ms > 0);
        }
        other => panic!("expected JobFailed, got {other:?}"),
    }
    assert!(traces.is_empty());
}

#[tokio::test]
async fn test_wall_clock_limit_beats_retry_budget() {
    let executor = CountingExecutor::new(usize::MAX, Duration::from_millis(30));
    let config = JobConfig {
        max_retries: 1_000,
        max_wall_clock_ms: 100,
        ..config()
    };
    let (manager, _) = manager(config, executor);

    let job_id = manager.submit("endless", "endless");
    assert_eq!(manager.wait(&job_id, soon()).await.unwrap(), JobStatus::TimedOut);
    assert!(matches!(
        manager.retrieve(&job_id),
        Err(ServingError::JobTimedOut { .. })
    ));

    // Terminal states never change.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.poll(&job_id).unwrap().status, JobStatus::TimedOut);
}

#[tokio::test]
async fn test_poll_never_blocks() {
    let executor = CountingExecutor::new(0, Duration::from_secs(2));
    let (manager, _) = manager(config(), executor);

    let job_id = manager.submit("slow", "slow");
    let started = std::time::Instant::now();
    let status = manager.poll(&job_id).unwrap().status;
    assert!(matches!(status, JobStatus::Pending | JobStatus::Running));
    assert!(matches!(
        manager.retrieve(&job_id).unwrap(),
        JobOutcome::InProgress(_)
    ));
    assert!(started.elapsed() < Duration::from_millis(50));

    let status = manager
        .wait(&job_id, Instant::now() + Duration::from_millis(20))
        .await
        .unwrap();
    assert!(!status.is_terminal());
}

#[tokio::test]
async fn test_distinct_keys_run_independently() {
    let executor = CountingExecutor::new(0, Duration::ZERO);
    let (manager, traces) = manager(config(), Arc::clone(&executor));

    let a = manager.submit("north road", "a");
    let b = manager.submit("south road", "b");
    assert_ne!(a, b);
    manager.wait(&a, soon()).await.unwrap();
    manager.wait(&b, soon()).await.unwrap();
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(traces.len(), 2);
}
