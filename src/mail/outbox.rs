use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{Mail, MailResult, MailSender};

/// Writes every mail as a JSON document into a directory, for pickup by
/// whatever actually delivers mail on the host.
#[derive(Debug, Clone)]
pub struct OutboxMailer {
    base_path: PathBuf,
    sender: String,
}

impl OutboxMailer {
    pub fn new<P: AsRef<Path>>(base_path: P, sender: &str) -> MailResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            sender: sender.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl MailSender for OutboxMailer {
    async fn send(&self, mail: &Mail) -> MailResult<()> {
        let now = Utc::now();
        let filename = format!("{}_{}.json", now.format("%Y%m%d_%H%M%S"), Uuid::now_v7());
        let path = self.base_path.join(filename);

        let json = serde_json::json!({
            "from": self.sender,
            "to": [mail.recipient],
            "subject": mail.subject,
            "text": mail.body,
            "attachments": mail.attachments,
            "queued_at": now,
        });

        fs::write(&path, serde_json::to_string_pretty(&json)?)?;
        info!("Queued mail to {} at {}", mail.recipient, path.display());
        Ok(())
    }
}
