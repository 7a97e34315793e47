use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

use crate::convert::{ConversionError, Converter};
use crate::jobs::{Job, JobId, JobStatus, JobStore};
use crate::notify::{Notice, Notifier};
use crate::queue::{Delivery, QueueError, WorkQueue};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Identity this loop leases messages under.
    pub consumer_id: String,
    /// Deadline for one conversion; keep it below the queue lease.
    pub convert_timeout: Duration,
    /// Pause after a queue or store failure before consuming again.
    pub error_backoff: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            consumer_id: "worker-1".to_string(),
            convert_timeout: Duration::from_secs(120),
            error_backoff: Duration::from_millis(250),
        }
    }
}

/// Terminal result of handling one delivery. Every variant has been
/// acknowledged (or found already released, see [`QueueError::LeaseLost`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Payload was not a job id.
    Malformed,
    /// The referenced job does not exist.
    Missing(JobId),
    Converted {
        job_id: JobId,
        destination: PathBuf,
        notified: bool,
    },
    Failed(JobId),
    /// The job already holds the other terminal status; nothing was written.
    Rejected {
        job_id: JobId,
        current: Option<JobStatus>,
    },
}

/// One worker loop: consume, look up, convert, record, notify, ack.
///
/// Instances share nothing but the queue and the store, so a pool is just N
/// clones with distinct consumer ids.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    converter: Arc<dyn Converter>,
    notifier: Arc<dyn Notifier>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        converter: Arc<dyn Converter>,
        notifier: Arc<dyn Notifier>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            converter,
            notifier,
            settings,
        }
    }

    pub fn with_consumer_id(&self, consumer_id: impl Into<String>) -> Self {
        let mut runner = self.clone();
        runner.settings.consumer_id = consumer_id.into();
        runner
    }

    pub fn consumer_id(&self) -> &str {
        &self.settings.consumer_id
    }

    /// Processes one message at a time until `shutdown` turns true or its
    /// sender is dropped. Shutdown is only observed between messages.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let consumer = self.settings.consumer_id.clone();
        tracing::info!(consumer = %consumer, "worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let consumed = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                consumed = self.queue.consume(&consumer) => consumed,
            };

            let delivery = match consumed {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(consumer = %consumer, error = %e, "consume failed");
                    tokio::time::sleep(self.settings.error_backoff).await;
                    continue;
                }
            };

            let span = tracing::info_span!(
                "image_job",
                consumer = %consumer,
                message_id = delivery.message_id,
                delivery_count = delivery.delivery_count,
                job_id = tracing::field::Empty,
            );

            match self.process(delivery).instrument(span).await {
                Ok(outcome) => tracing::debug!(consumer = %consumer, ?outcome, "message done"),
                Err(e) => {
                    // not acked: the lease runs out and the queue hands it out again
                    tracing::error!(consumer = %consumer, error = %e, "processing aborted, awaiting redelivery");
                    tokio::time::sleep(self.settings.error_backoff).await;
                }
            }
        }

        tracing::info!(consumer = %consumer, "worker loop stopped");
    }

    /// Runs the per-message algorithm for one delivery.
    ///
    /// `Err` means the store or queue failed before the message could be
    /// acknowledged; the delivery must be left to expire.
    pub async fn process(&self, delivery: Delivery) -> anyhow::Result<Outcome> {
        if delivery.is_redelivery() {
            tracing::warn!(delivery_count = delivery.delivery_count, "processing redelivered message");
        }

        let job_id = match delivery.payload.parse::<JobId>() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(payload = %delivery.payload, error = %e, "malformed payload, dropping message");
                self.ack(&delivery).await?;
                return Ok(Outcome::Malformed);
            }
        };
        tracing::Span::current().record("job_id", job_id.as_i64());

        let Some(job) = self.store.get(job_id).await? else {
            tracing::warn!(job_id = %job_id, "job not found, dropping message");
            self.ack(&delivery).await?;
            return Ok(Outcome::Missing(job_id));
        };

        if job.status == JobStatus::Failed {
            // converting again could only produce an orphaned output file
            let outcome = self.rejected(job.id, JobStatus::Converted).await;
            self.ack(&delivery).await?;
            return Ok(outcome);
        }

        let outcome = match self.convert(Path::new(&job.file_path)).await {
            Ok(destination) => self.on_converted(&job, destination).await?,
            Err(e) => self.on_conversion_failed(&job, e).await?,
        };

        self.ack(&delivery).await?;
        Ok(outcome)
    }

    async fn convert(&self, source: &Path) -> Result<PathBuf, ConversionError> {
        let deadline = self.settings.convert_timeout;
        match tokio::time::timeout(deadline, self.converter.convert(source)).await {
            Ok(result) => result,
            Err(_) => Err(ConversionError::TimedOut(deadline)),
        }
    }

    async fn on_converted(&self, job: &Job, destination: PathBuf) -> anyhow::Result<Outcome> {
        let path = destination.to_string_lossy().into_owned();

        if !self.store.set_converted(job.id, &path).await? {
            return Ok(self.rejected(job.id, JobStatus::Converted).await);
        }
        tracing::info!(job_id = %job.id, destination = %path, "image converted");

        let notice = Notice::converted(job.email.clone(), destination.clone());
        let notified = match self.notifier.notify(&notice).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(job_id = %job.id, to = %job.email, error = %e, "notification failed");
                false
            }
        };

        Ok(Outcome::Converted {
            job_id: job.id,
            destination,
            notified,
        })
    }

    async fn on_conversion_failed(
        &self,
        job: &Job,
        err: ConversionError,
    ) -> anyhow::Result<Outcome> {
        tracing::warn!(job_id = %job.id, source = %job.file_path, error = %err, "conversion failed");

        if !self.store.set_status(job.id, JobStatus::Failed).await? {
            return Ok(self.rejected(job.id, JobStatus::Failed).await);
        }
        Ok(Outcome::Failed(job.id))
    }

    async fn rejected(&self, job_id: JobId, wanted: JobStatus) -> Outcome {
        let current = self.store.get(job_id).await.ok().flatten().map(|j| j.status);
        tracing::warn!(
            job_id = %job_id,
            wanted = %wanted,
            current = ?current,
            "terminal transition refused, leaving job as is"
        );
        Outcome::Rejected { job_id, current }
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        match self.queue.ack(&delivery.handle).await {
            Ok(()) => Ok(()),
            Err(QueueError::LeaseLost { message_id }) => {
                tracing::warn!(message_id, "lease lost before ack, another delivery will repeat the work");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
