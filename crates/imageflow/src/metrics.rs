use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::{JobStore, StatusCounts};
use crate::queue::{QueueDepth, WorkQueue};

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub now_utc: DateTime<Utc>,
    pub queue: String,
    pub jobs: StatusCounts,
    pub messages: QueueDepth,
}

impl Metrics {
    pub async fn snapshot(
        store: &dyn JobStore,
        queue: &dyn WorkQueue,
        queue_name: &str,
    ) -> anyhow::Result<Self> {
        let jobs = store.status_counts().await?;
        let messages = queue.depth().await?;

        Ok(Self {
            now_utc: Utc::now(),
            queue: queue_name.to_string(),
            jobs,
            messages,
        })
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# HELP imageflow_queue_ready Messages waiting to be consumed\n",
                "# TYPE imageflow_queue_ready gauge\n",
                "imageflow_queue_ready{{queue=\"{queue}\"}} {ready}\n",
                "# HELP imageflow_queue_in_flight Messages leased and not yet acknowledged\n",
                "# TYPE imageflow_queue_in_flight gauge\n",
                "imageflow_queue_in_flight{{queue=\"{queue}\"}} {in_flight}\n",
                "# HELP imageflow_jobs Jobs by status\n",
                "# TYPE imageflow_jobs gauge\n",
                "imageflow_jobs{{status=\"Uploaded\"}} {uploaded}\n",
                "imageflow_jobs{{status=\"Converted\"}} {converted}\n",
                "imageflow_jobs{{status=\"Failed\"}} {failed}\n",
            ),
            queue = self.queue,
            ready = self.messages.ready,
            in_flight = self.messages.in_flight,
            uploaded = self.jobs.uploaded,
            converted = self.jobs.converted,
            failed = self.jobs.failed,
        )
    }
}
