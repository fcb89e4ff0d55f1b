pub mod http;
pub mod outbox;

pub use http::HttpMailer;
pub use outbox::OutboxMailer;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{MailConfig, MailTransport};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail relay rejected the message (status={status}): {body}")]
    Rejected { status: u16, body: String },
}

pub type MailResult<T> = Result<T, MailError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

impl Mail {
    pub fn new(recipient: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: &Mail) -> MailResult<()>;
}

pub fn create_mailer(config: &MailConfig) -> MailResult<Arc<dyn MailSender>> {
    match &config.transport {
        MailTransport::Outbox { dir } => Ok(Arc::new(OutboxMailer::new(dir, &config.sender)?)),
        MailTransport::Http { endpoint, token } => Ok(Arc::new(HttpMailer::new(
            endpoint.clone(),
            &config.sender,
            token.clone(),
        )?)),
    }
}
