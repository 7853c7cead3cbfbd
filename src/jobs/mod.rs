pub mod job;
pub mod manager;

pub use job::{AsyncJob, JobStatus};
pub use manager::{JobExecutor, JobManager, JobOutcome, JobOutput};
