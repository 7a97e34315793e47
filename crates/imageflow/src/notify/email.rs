//! Email delivery via SMTP.
//!
//! [`SmtpNotifier`] wraps the `lettre` async SMTP transport. The transport is
//! built once at construction; each notice becomes a multipart message with a
//! plain-text part and, when the file exists, the converted image attached.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::Path;

use super::{NotificationError, Notice, Notifier};

// ---------------------------------------------------------------------------
// EmailConfig
// ---------------------------------------------------------------------------

/// Default SMTP port (STARTTLS).
pub const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Sender address; falls back to the SMTP username.
    pub from_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

impl EmailConfig {
    /// Reads the `SMTP_*` variables through `get`. Returns `None` when
    /// `SMTP_SERVER` is unset, meaning email is not configured.
    ///
    /// | Variable        | Required | Default                 |
    /// |-----------------|----------|-------------------------|
    /// | `SMTP_SERVER`   | yes      |                         |
    /// | `SMTP_PORT`     | no       | `587`                   |
    /// | `SMTP_USERNAME` | no       |                         |
    /// | `SMTP_PASSWORD` | no       |                         |
    /// | `SMTP_FROM`     | no       | username, else `noreply@localhost` |
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let smtp_host = get("SMTP_SERVER").filter(|s| !s.trim().is_empty())?;
        let smtp_user = get("SMTP_USERNAME").filter(|s| !s.is_empty());
        let from_address = get("SMTP_FROM")
            .filter(|s| !s.is_empty())
            .or_else(|| smtp_user.clone())
            .unwrap_or_else(|| "noreply@localhost".to_string());

        Some(Self {
            smtp_host,
            smtp_port: get("SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address,
            smtp_user,
            smtp_password: get("SMTP_PASSWORD"),
        })
    }
}

// ---------------------------------------------------------------------------
// SmtpNotifier
// ---------------------------------------------------------------------------

pub struct SmtpNotifier {
    config: EmailConfig,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: EmailConfig) -> Result<Self, NotificationError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port);

        if let (Some(user), Some(pass)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            config,
        })
    }

    /// Assembles the MIME message without touching the network.
    pub async fn build_message(&self, notice: &Notice) -> Result<Message, NotificationError> {
        let attachment = match notice.attachment.as_deref() {
            Some(path) => read_attachment(path).await?,
            None => None,
        };
        build_message(&self.config.from_address, notice, attachment)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotificationError> {
        let message = self.build_message(notice).await?;
        self.mailer.send(message).await?;

        tracing::info!(to = %notice.to, attachment = ?notice.attachment, "notification email sent");
        Ok(())
    }
}

/// Attachment as `(file name, bytes)`. A path that does not exist yields
/// `None` and the email goes out without it.
async fn read_attachment(path: &Path) -> Result<Option<(String, Vec<u8>)>, NotificationError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image.png".to_string());
            Ok(Some((name, bytes)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "attachment missing, sending without it");
            Ok(None)
        }
        Err(e) => Err(NotificationError::Attachment {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

pub fn build_message(
    from: &str,
    notice: &Notice,
    attachment: Option<(String, Vec<u8>)>,
) -> Result<Message, NotificationError> {
    let builder = Message::builder()
        .from(from.parse()?)
        .to(notice.to.parse()?)
        .subject(notice.subject.clone());

    let text = SinglePart::builder()
        .header(ContentType::TEXT_PLAIN)
        .body(notice.body.clone());

    let message = match attachment {
        Some((name, bytes)) => {
            let content_type = ContentType::parse("image/png")
                .map_err(|e| NotificationError::Build(e.to_string()))?;
            builder.multipart(
                MultiPart::mixed()
                    .singlepart(text)
                    .singlepart(Attachment::new(name).body(bytes, content_type)),
            )
        }
        None => builder.multipart(MultiPart::mixed().singlepart(text)),
    };

    message.map_err(|e| NotificationError::Build(e.to_string()))
}
