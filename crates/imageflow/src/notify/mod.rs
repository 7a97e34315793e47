//! Completion notices sent after a successful conversion.
//!
//! Delivery is best-effort: the worker logs a [`NotificationError`] and moves
//! on, it never changes job status or the acknowledgment decision.

use async_trait::async_trait;
use std::path::PathBuf;

pub mod email;
pub mod memory;

pub use email::{EmailConfig, SmtpNotifier};
pub use memory::RecordingNotifier;

pub const CONVERTED_SUBJECT: &str = "Your Image Has Been Converted!";
pub const CONVERTED_BODY: &str = "Hello,\n\nYour image has been successfully converted to PNG format. You can find the converted image attached to this email.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

impl Notice {
    pub fn converted(to: impl Into<String>, attachment: impl Into<PathBuf>) -> Self {
        Self {
            to: to.into(),
            subject: CONVERTED_SUBJECT.to_string(),
            body: CONVERTED_BODY.to_string(),
            attachment: Some(attachment.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("email build error: {0}")]
    Build(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<(), NotificationError>;
}

/// Used when no mail transport is configured; logs the notice and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotificationError> {
        tracing::info!(to = %notice.to, subject = %notice.subject, "notifications disabled, skipping");
        Ok(())
    }
}
