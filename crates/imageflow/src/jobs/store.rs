use async_trait::async_trait;

use crate::jobs::model::{Job, JobId, JobStatus, NewJob, StatusCounts};

/// Durable owner of job lifecycle. Every mutation is a single-row update.
///
/// `set_status` and `set_converted` return whether the job is in the requested
/// state once the call returns. Repeating a call is a no-op that still returns
/// `true`; a transition out of a different terminal status is refused and
/// returns `false`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: NewJob) -> anyhow::Result<JobId>;

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>>;

    /// Rejects `Converted`: that state is only reachable with a path, through
    /// [`JobStore::set_converted`].
    async fn set_status(&self, id: JobId, status: JobStatus) -> anyhow::Result<bool>;

    /// Sets `status = Converted` and the output path in one write.
    async fn set_converted(&self, id: JobId, converted_path: &str) -> anyhow::Result<bool>;

    async fn status_counts(&self) -> anyhow::Result<StatusCounts>;
}

pub(crate) fn ensure_plain_status(status: JobStatus) -> anyhow::Result<()> {
    if status == JobStatus::Converted {
        anyhow::bail!("Converted requires an output path; use set_converted");
    }
    Ok(())
}

pub(crate) fn ensure_converted_path(converted_path: &str) -> anyhow::Result<()> {
    if converted_path.trim().is_empty() {
        anyhow::bail!("Converted requires a non-empty output path");
    }
    Ok(())
}
