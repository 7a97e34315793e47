use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{NotificationError, Notice, Notifier};

/// Keeps every notice it is asked to send. With `fail(true)` each attempt is
/// still recorded but reported as rejected.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notice>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Notice> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn attempts_for(&self, address: &str) -> usize {
        self.attempts().iter().filter(|n| n.to == address).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notice.clone());

        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Rejected(format!(
                "recording notifier set to fail for {}",
                notice.to
            )));
        }
        Ok(())
    }
}
