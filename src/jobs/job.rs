//! Async job records and their state machine.
//!
//! `Pending -> Running -> {Succeeded, Failed, TimedOut}`. `Pending` may also go
//! straight to `TimedOut` when the wall-clock limit expires while the job is
//! still queued. Terminal states never change.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::events::unix_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, TimedOut) | (Running, Succeeded | Failed | TimedOut)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible job record.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncJob {
    pub job_id: String,
    pub dedupe_key: String,
    pub status: JobStatus,
    /// Unix milliseconds.
    pub submitted_at: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Guardrail rule that replaced the job's output with the fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail_rule: Option<String>,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl AsyncJob {
    pub fn new(job_id: String, dedupe_key: String) -> Self {
        Self {
            job_id,
            dedupe_key,
            status: JobStatus::Pending,
            submitted_at: unix_millis(),
            attempts: 0,
            result_ref: None,
            failure_ref: None,
            failure_reason: None,
            guardrail_rule: None,
            finished_at: None,
        }
    }

    pub fn result_path(&self) -> String {
        format!("/jobs/{}/result", self.job_id)
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
            match next {
                JobStatus::Succeeded => self.result_ref = Some(self.result_path()),
                _ => self.failure_ref = Some(self.result_path()),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut job = AsyncJob::new("j1".into(), "k".into());
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Succeeded));
        assert_eq!(job.result_ref.as_deref(), Some("/jobs/j1/result"));
        assert!(job.failure_ref.is_none());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for terminal in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::TimedOut] {
            let mut job = AsyncJob::new("j".into(), "k".into());
            job.transition(JobStatus::Running);
            assert!(job.transition(terminal));
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Succeeded,
                JobStatus::Failed,
                JobStatus::TimedOut,
            ] {
                assert!(!job.transition(next));
                assert_eq!(job.status, terminal);
            }
        }
    }

    #[test]
    fn test_pending_cannot_skip_to_success() {
        let mut job = AsyncJob::new("j".into(), "k".into());
        assert!(!job.transition(JobStatus::Succeeded));
        assert!(job.transition(JobStatus::TimedOut));
        assert_eq!(job.failure_ref.as_deref(), Some("/jobs/j/result"));
    }
}
