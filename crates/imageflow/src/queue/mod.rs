//! Durable work queue carrying job ids from submission to the workers.
//!
//! Delivery is at-least-once: a consumed message is leased to one consumer and
//! comes back to the queue if it is not acknowledged before the lease runs out.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::JobId;

pub mod memory;
pub mod repo;

pub use memory::InMemoryWorkQueue;
pub use repo::PgWorkQueue;

/// Default channel name shared by producers and workers.
pub const DEFAULT_QUEUE: &str = "image_conversion_queue";

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub queue: String,
    /// How long a consumer may hold a message before it is redelivered.
    pub lease: Duration,
    /// Sleep between claim attempts while the queue is empty.
    pub poll_interval: Duration,
    /// Minimum spacing between expired-lease sweeps.
    pub reap_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_millis(250),
            reap_interval: Duration::from_secs(5),
        }
    }
}

/// Proof of a claim. Only the holder of the current lease token can ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHandle {
    pub message_id: i64,
    pub lease_token: Uuid,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: i64,
    pub payload: String,
    /// 1 on first delivery, higher on redelivery.
    pub delivery_count: i32,
    pub handle: AckHandle,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: i64,
    pub in_flight: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The lease expired and the message was released or handed to another
    /// consumer before this ack arrived.
    #[error("lease lost for message {message_id}")]
    LeaseLost { message_id: i64 },

    #[error("queue unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Unavailable(e.into())
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Durably enqueues a raw text payload.
    async fn publish_payload(&self, payload: &str) -> Result<(), QueueError>;

    async fn publish(&self, job_id: JobId) -> Result<(), QueueError> {
        self.publish_payload(&job_id.to_string()).await
    }

    /// Waits until a message can be claimed for `consumer` and leases it.
    async fn consume(&self, consumer: &str) -> Result<Delivery, QueueError>;

    /// Removes the message for good. Fails with [`QueueError::LeaseLost`] when
    /// `handle` no longer holds the lease.
    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
