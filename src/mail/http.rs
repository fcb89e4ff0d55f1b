use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::info;
use reqwest::{Client, ClientBuilder};
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::{Mail, MailError, MailResult, MailSender};

#[derive(Debug, Serialize)]
struct RelayAttachment {
    filename: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    text: &'a str,
    attachments: Vec<RelayAttachment>,
}

/// Hands mail to an HTTP relay as JSON, attachments inlined as base64.
#[derive(Clone)]
pub struct HttpMailer {
    client: Client,
    endpoint: Url,
    sender: String,
    token: Option<String>,
}

impl HttpMailer {
    pub fn new(endpoint: Url, sender: &str, token: Option<String>) -> MailResult<Self> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            sender: sender.to_string(),
            token,
        })
    }

    async fn attachments(&self, mail: &Mail) -> MailResult<Vec<RelayAttachment>> {
        let mut attachments = Vec::with_capacity(mail.attachments.len());
        for path in &mail.attachments {
            let bytes = tokio::fs::read(path).await?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            attachments.push(RelayAttachment {
                filename,
                content: STANDARD.encode(bytes),
            });
        }
        Ok(attachments)
    }
}

#[async_trait]
impl MailSender for HttpMailer {
    async fn send(&self, mail: &Mail) -> MailResult<()> {
        let message = RelayMessage {
            from: &self.sender,
            to: vec![mail.recipient.as_str()],
            subject: &mail.subject,
            text: &mail.body,
            attachments: self.attachments(mail).await?,
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&message);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!("Relayed mail to {} from {}", mail.recipient, self.sender);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_posts_json_with_attachments() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let attachment = dir.path().join("page.html");
        std::fs::write(&attachment, "<p>hi</p>").unwrap();

        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("authorization", "Bearer s3cret"))
            .and(body_json(json!({
                "from": "watch@example.org",
                "to": ["jane@example.org"],
                "subject": "Slots",
                "text": "Go book",
                "attachments": [{"filename": "page.html", "content": "PHA+aGk8L3A+"}],
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap().join("/send").unwrap();
        let mailer = HttpMailer::new(endpoint, "watch@example.org", Some("s3cret".into())).unwrap();
        let mail = Mail::new("jane@example.org", "Slots", "Go book").with_attachments(vec![attachment]);

        mailer.send(&mail).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad sender"))
            .mount(&server)
            .await;

        let mailer = HttpMailer::new(Url::parse(&server.uri()).unwrap(), "x@y.z", None).unwrap();
        let err = mailer.send(&Mail::new("a@b.c", "s", "b")).await.unwrap_err();

        assert!(matches!(err, MailError::Rejected { status: 400, ref body } if body == "bad sender"));
    }

    #[tokio::test]
    async fn test_missing_attachment_is_an_error() {
        let mailer = HttpMailer::new(Url::parse("http://127.0.0.1:9/").unwrap(), "x@y.z", None).unwrap();
        let mail = Mail::new("a@b.c", "s", "b")
            .with_attachments(vec!["/nonexistent/slotwatch/file.png".into()]);
        assert!(matches!(mailer.send(&mail).await, Err(MailError::Io(_))));
    }
}
