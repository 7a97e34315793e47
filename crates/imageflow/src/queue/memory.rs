use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::queue::{AckHandle, Delivery, QueueDepth, QueueError, QueueSettings, WorkQueue};

/// Process-local queue with the same lease and redelivery rules as
/// [`super::PgWorkQueue`]. Messages do not survive the process.
pub struct InMemoryWorkQueue {
    settings: QueueSettings,
    state: Mutex<State>,
    published: Notify,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct State {
    next_id: i64,
    messages: BTreeMap<i64, Message>,
}

struct Message {
    payload: String,
    delivery_count: i32,
    lease: Option<Lease>,
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl InMemoryWorkQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(State::default()),
            published: Notify::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Expires every outstanding lease now, as if each consumer had died and
    /// its lease timed out.
    pub fn expire_leases(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        for msg in state.messages.values_mut() {
            if let Some(lease) = msg.lease.as_mut() {
                lease.expires_at = now;
            }
        }
        drop(state);
        self.published.notify_waiters();
    }

    /// Messages not yet acknowledged, leased or not.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_claim(&self) -> Option<Delivery> {
        let now = Instant::now();
        let mut state = self.lock();
        let (&message_id, msg) = state
            .messages
            .iter_mut()
            .find(|(_, m)| m.lease.as_ref().map_or(true, |l| !l.is_live(now)))?;

        let lease_token = Uuid::new_v4();
        msg.delivery_count += 1;
        msg.lease = Some(Lease {
            token: lease_token,
            expires_at: now + self.settings.lease,
        });

        Some(Delivery {
            message_id,
            payload: msg.payload.clone(),
            delivery_count: msg.delivery_count,
            handle: AckHandle {
                message_id,
                lease_token,
            },
        })
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable(anyhow::anyhow!(
                "queue {} unavailable",
                self.settings.queue
            )));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn publish_payload(&self, payload: &str) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.messages.insert(
            id,
            Message {
                payload: payload.to_string(),
                delivery_count: 0,
                lease: None,
            },
        );
        drop(state);
        self.published.notify_one();
        Ok(())
    }

    async fn consume(&self, _consumer: &str) -> Result<Delivery, QueueError> {
        loop {
            self.check()?;
            if let Some(delivery) = self.try_claim() {
                return Ok(delivery);
            }
            tokio::select! {
                _ = self.published.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.lock();
        let holds_lease = state
            .messages
            .get(&handle.message_id)
            .and_then(|m| m.lease.as_ref())
            .is_some_and(|l| l.token == handle.lease_token);

        if !holds_lease {
            return Err(QueueError::LeaseLost {
                message_id: handle.message_id,
            });
        }
        state.messages.remove(&handle.message_id);
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.check()?;
        let now = Instant::now();
        let state = self.lock();
        let in_flight = state
            .messages
            .values()
            .filter(|m| m.lease.as_ref().is_some_and(|l| l.is_live(now)))
            .count() as i64;
        Ok(QueueDepth {
            ready: state.messages.len() as i64 - in_flight,
            in_flight,
        })
    }
}
