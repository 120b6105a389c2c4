//! Outbound e-mail.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{info, warn};

use crate::Config;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Email {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}

/// Sends through the Mailgun messages API.
pub struct MailgunSender {
    client: Client,
    from: String,
    endpoint: String,
    api_key: String,
}

impl MailgunSender {
    pub fn new(
        sender_name: &str,
        sender_address: &str,
        api_base: &str,
        domain: &str,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            from: format!("{sender_name} <{sender_address}>"),
            endpoint: format!("{}/v3/{}/messages", api_base.trim_end_matches('/'), domain),
            api_key,
        })
    }

    fn form(&self, email: &Email) -> Form {
        let mut form = Form::new()
            .text("from", self.from.clone())
            .text("subject", email.subject.clone())
            .text("html", email.html.clone());

        for to in &email.to {
            form = form.text("to", to.clone());
        }
        for cc in &email.cc {
            form = form.text("cc", cc.clone());
        }
        for bcc in &email.bcc {
            form = form.text("bcc", bcc.clone());
        }
        for attachment in &email.attachments {
            let part = Part::bytes(attachment.content.clone()).file_name(attachment.filename.clone());
            form = form.part("attachment", part);
        }
        form
    }
}

#[async_trait]
impl EmailSender for MailgunSender {
    async fn send(&self, email: &Email) -> Result<()> {
        if email.to.is_empty() {
            bail!("email has no recipients");
        }

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth("api", Some(&self.api_key))
            .multipart(self.form(email))
            .send()
            .await
            .context("Failed to reach Mailgun")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Mailgun rejected message with status {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            );
        }

        info!(
            recipients = email.to.len(),
            subject = %email.subject,
            attachments = email.attachments.len(),
            "email_sent"
        );
        Ok(())
    }
}

/// Logs messages instead of sending them. Used when no Mailgun key is set.
#[derive(Debug, Default, Clone)]
pub struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    async fn send(&self, email: &Email) -> Result<()> {
        info!(
            to = ?email.to,
            subject = %email.subject,
            html_length = email.html.len(),
            "email_logged"
        );
        Ok(())
    }
}

/// Pick the sender for this deployment: Mailgun when a key and domain are
/// configured, otherwise [`LogSender`].
pub fn sender_from_config(config: &Config) -> Result<Arc<dyn EmailSender>> {
    match (&config.mailgun_api_key, &config.mailgun_domain) {
        (Some(api_key), Some(domain)) => {
            let sender = MailgunSender::new(
                &config.email_sender_name,
                &config.email_sender_address,
                &config.mailgun_api_base,
                domain,
                api_key.clone(),
                config.request_timeout(),
            )?;
            info!(domain = %domain, "mailgun_sender_configured");
            Ok(Arc::new(sender))
        }
        _ => {
            warn!("mailgun_not_configured_logging_emails");
            Ok(Arc::new(LogSender))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_built_from_base_and_domain() {
        let sender = MailgunSender::new(
            "Simple Bank",
            "bank@example.com",
            "https://api.mailgun.net/",
            "mg.example.com",
            "key".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(sender.endpoint, "https://api.mailgun.net/v3/mg.example.com/messages");
        assert_eq!(sender.from, "Simple Bank <bank@example.com>");
    }

    #[tokio::test]
    async fn test_mailgun_requires_recipient() {
        let sender = MailgunSender::new(
            "Simple Bank",
            "bank@example.com",
            "http://127.0.0.1:9",
            "mg.example.com",
            "key".to_string(),
            Duration::from_millis(100),
        )
        .unwrap();

        let err = sender.send(&Email::default()).await.unwrap_err();
        assert!(err.to_string().contains("no recipients"));
    }

    #[tokio::test]
    async fn test_log_sender_accepts_everything() {
        let email = Email {
            to: vec!["alice@example.com".to_string()],
            subject: "hi".to_string(),
            ..Email::default()
        };
        assert!(LogSender.send(&email).await.is_ok());
    }
}
