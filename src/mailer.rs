//! Outbound email

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Mail delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Email) -> Result<(), MailError>;
}

/// Writes messages to the log instead of delivering them
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: Email) -> Result<(), MailError> {
        if !email.to.contains('@') {
            return Err(MailError::InvalidRecipient(email.to));
        }
        tracing::info!(
            from = %email.from,
            to = %email.to,
            subject = %email.subject,
            "Email queued"
        );
        tracing::debug!(body = %email.body, "Email body");
        Ok(())
    }
}
