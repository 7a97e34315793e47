// crates/imageflow/src/queue/repo.rs

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Mutex;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use crate::queue::{AckHandle, Delivery, QueueDepth, QueueError, QueueSettings, WorkQueue};

/// Work queue backed by the `queue_messages` table.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so concurrent consumers never lease the
/// same row. An unacknowledged lease is cleared by the reaper once it expires,
/// after which the message is claimable again.
pub struct PgWorkQueue {
    pool: PgPool,
    settings: QueueSettings,
    last_reap_at: Mutex<Option<Instant>>,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool, settings: QueueSettings) -> Self {
        Self {
            pool,
            settings,
            last_reap_at: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    /// Claim exactly one ready message for `consumer`, or `None` when the queue
    /// has nothing unleased.
    #[instrument(skip(self), fields(queue = %self.settings.queue))]
    pub async fn lease_one(&self, consumer: &str) -> anyhow::Result<Option<Delivery>> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM queue_messages
            WHERE queue = $1
              AND leased_by IS NULL
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&self.settings.queue)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(message_id) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let lease_token = Uuid::new_v4();
        let lease_ms = i64::try_from(self.settings.lease.as_millis()).unwrap_or(i64::MAX);

        let (payload, delivery_count): (String, i32) = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET leased_by = $2,
                lease_token = $3,
                lease_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                delivery_count = delivery_count + 1
            WHERE id = $1
            RETURNING payload, delivery_count
            "#,
        )
        .bind(message_id)
        .bind(consumer)
        .bind(lease_token)
        .bind(lease_ms)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(Delivery {
            message_id,
            payload,
            delivery_count,
            handle: AckHandle {
                message_id,
                lease_token,
            },
        }))
    }

    // ----------------------------
    // Maintenance
    // ----------------------------

    /// Release every lease whose deadline passed. Returns how many messages
    /// became claimable again.
    pub async fn reap_expired_leases(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE queue_messages
            SET leased_by = NULL,
                lease_token = NULL,
                lease_expires_at = NULL
            WHERE queue = $1
              AND leased_by IS NOT NULL
              AND lease_expires_at < now()
            "#,
        )
        .bind(&self.settings.queue)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    // reclaim on a fixed interval to avoid hot-loop write load
    async fn reap_if_due(&self) -> anyhow::Result<()> {
        let due = {
            let mut last = self
                .last_reap_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match *last {
                Some(at) if at.elapsed() < self.settings.reap_interval => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };

        if due {
            let reaped = self.reap_expired_leases().await?;
            if reaped > 0 {
                tracing::info!(reaped, queue = %self.settings.queue, "released expired leases");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    #[instrument(skip(self), fields(queue = %self.settings.queue))]
    async fn publish_payload(&self, payload: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages (queue, payload)
            VALUES ($1, $2)
            "#,
        )
        .bind(&self.settings.queue)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn consume(&self, consumer: &str) -> Result<Delivery, QueueError> {
        loop {
            self.reap_if_due().await?;

            if let Some(delivery) = self.lease_one(consumer).await? {
                return Ok(delivery);
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    #[instrument(skip(self), fields(message_id = handle.message_id))]
    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let res = sqlx::query(
            r#"
            DELETE FROM queue_messages
            WHERE id = $1
              AND lease_token = $2
            "#,
        )
        .bind(handle.message_id)
        .bind(handle.lease_token)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(QueueError::LeaseLost {
                message_id: handle.message_id,
            });
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let (ready, in_flight): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
              COUNT(*) FILTER (WHERE leased_by IS NULL),
              COUNT(*) FILTER (WHERE leased_by IS NOT NULL)
            FROM queue_messages
            WHERE queue = $1
            "#,
        )
        .bind(&self.settings.queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepth { ready, in_flight })
    }
}
