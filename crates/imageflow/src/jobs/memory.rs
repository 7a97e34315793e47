use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::jobs::model::{Job, JobId, JobStatus, NewJob, StatusCounts};
use crate::jobs::store::{ensure_converted_path, ensure_plain_status, JobStore};

/// Process-local [`JobStore`] with the same transition rules as [`super::JobsRepo`].
///
/// `set_unavailable(true)` makes every call fail, which is how tests simulate
/// the database going away mid-pipeline.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrites a job's status and path with no transition checks.
    pub fn force_state(&self, id: JobId, status: JobStatus, converted_path: Option<&str>) {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.status = status;
            job.converted_path = converted_path.map(str::to_string);
            job.updated_at = Utc::now();
        }
    }

    pub fn remove(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.remove(&id)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("job store unavailable");
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: NewJob) -> anyhow::Result<JobId> {
        self.check()?;
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = JobId(inner.next_id);
        let now = Utc::now();
        inner.jobs.insert(
            id,
            Job {
                id,
                filename: job.filename,
                file_path: job.file_path,
                converted_path: None,
                status: JobStatus::Uploaded,
                email: job.email,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        self.check()?;
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn set_status(&self, id: JobId, status: JobStatus) -> anyhow::Result<bool> {
        ensure_plain_status(status)?;
        self.check()?;
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.status.can_become(status) {
            return Ok(false);
        }
        job.status = status;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_converted(&self, id: JobId, converted_path: &str) -> anyhow::Result<bool> {
        self.check()?;
        ensure_converted_path(converted_path)?;
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        let accepted = match job.status {
            JobStatus::Uploaded => true,
            JobStatus::Converted => job.converted_path.as_deref() == Some(converted_path),
            JobStatus::Failed => false,
        };
        if !accepted {
            return Ok(false);
        }
        job.status = JobStatus::Converted;
        job.converted_path = Some(converted_path.to_string());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn status_counts(&self) -> anyhow::Result<StatusCounts> {
        self.check()?;
        let mut counts = StatusCounts::default();
        for job in self.lock().jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_job() -> (InMemoryJobStore, JobId) {
        let store = InMemoryJobStore::new();
        let id = store
            .create(NewJob::for_upload("uploads/a.jpg", "a@example.com"))
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids_in_uploaded_state() {
        let (store, first) = store_with_job().await;
        let second = store
            .create(NewJob::for_upload("uploads/b.jpg", "b@example.com"))
            .await
            .unwrap();
        assert!(second > first);

        let job = store.get(first).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.converted_path, None);
        assert_eq!(job.filename, "a.jpg");
    }

    #[tokio::test]
    async fn set_converted_twice_is_idempotent() {
        let (store, id) = store_with_job().await;
        assert!(store.set_converted(id, "out/a.png").await.unwrap());
        assert!(store.set_converted(id, "out/a.png").await.unwrap());
        assert!(!store.set_converted(id, "out/other.png").await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Converted);
        assert_eq!(job.converted_path.as_deref(), Some("out/a.png"));
    }

    #[tokio::test]
    async fn failed_is_terminal() {
        let (store, id) = store_with_job().await;
        assert!(store.set_status(id, JobStatus::Failed).await.unwrap());
        assert!(store.set_status(id, JobStatus::Failed).await.unwrap());
        assert!(!store.set_converted(id, "out/a.png").await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.converted_path, None);
    }

    #[tokio::test]
    async fn set_status_refuses_converted() {
        let (store, id) = store_with_job().await;
        assert!(store.set_status(id, JobStatus::Converted).await.is_err());
    }

    #[tokio::test]
    async fn set_converted_refuses_empty_path() {
        let (store, id) = store_with_job().await;
        assert!(store.set_converted(id, "").await.is_err());
        assert!(store.set_converted(id, "  ").await.is_err());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.converted_path, None);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let (store, id) = store_with_job().await;
        store.set_unavailable(true);
        assert!(store.get(id).await.is_err());
        assert!(store.set_status(id, JobStatus::Failed).await.is_err());
        store.set_unavailable(false);
        assert!(store.get(id).await.unwrap().is_some());
    }
}
