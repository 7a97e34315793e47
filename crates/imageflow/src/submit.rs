//! Producer side: record an uploaded file as a job and queue its id.

use std::path::Path;

use crate::jobs::{JobId, JobStore, NewJob};
use crate::queue::{QueueError, WorkQueue};

pub const ALLOWED_EXTENSIONS: [&str; 2] = ["jpg", "jpeg"];

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Invalid(String),

    #[error("failed to record job: {0}")]
    Store(#[source] anyhow::Error),

    /// The job row exists (status `Uploaded`) but its id never reached the queue.
    #[error("job {job_id} recorded but not queued: {source}")]
    Publish {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

pub fn allowed_file(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// Creates an `Uploaded` job for `file_path` and publishes its id.
pub async fn submit(
    store: &dyn JobStore,
    queue: &dyn WorkQueue,
    file_path: &Path,
    email: &str,
) -> Result<JobId, SubmitError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(SubmitError::Invalid("email is required".into()));
    }

    let new_job = NewJob::for_upload(file_path, email);
    if new_job.filename.is_empty() {
        return Err(SubmitError::Invalid("file name is required".into()));
    }
    if !allowed_file(&new_job.filename) {
        return Err(SubmitError::Invalid(format!(
            "{}: only JPG or JPEG images are allowed",
            new_job.filename
        )));
    }

    let job_id = store.create(new_job).await.map_err(SubmitError::Store)?;

    queue
        .publish(job_id)
        .await
        .map_err(|source| SubmitError::Publish { job_id, source })?;

    tracing::info!(job_id = %job_id, "job queued");
    Ok(job_id)
}
