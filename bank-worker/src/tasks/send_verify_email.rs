//! `task:send_verify_email`: mail a verification link to a new user.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::distributor::{DistributeError, TaskDistributor};
use crate::mail::{Email, EmailSender};
use crate::processor::{TaskError, TaskHandler};
use crate::store::{CreateVerifyEmail, Store};
use crate::task::{Envelope, NewTask, TaskId, TaskOptions};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

const SECRET_CODE_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub user_id: i64,
}

pub async fn distribute_send_verify_email(
    distributor: &dyn TaskDistributor,
    payload: &PayloadSendVerifyEmail,
    options: TaskOptions,
) -> Result<TaskId, DistributeError> {
    let task = NewTask::json(TASK_SEND_VERIFY_EMAIL, payload)?.with_options(options);
    distributor.distribute(task).await
}

pub struct SendVerifyEmailHandler {
    store: Arc<dyn Store>,
    mailer: Arc<dyn EmailSender>,
    verify_url: Url,
}

impl SendVerifyEmailHandler {
    /// `verify_url` is the page users land on; the record id and secret code
    /// are appended as query parameters.
    pub fn new(store: Arc<dyn Store>, mailer: Arc<dyn EmailSender>, verify_url: Url) -> Self {
        Self {
            store,
            mailer,
            verify_url,
        }
    }

    fn verify_link(&self, email_id: i64, secret_code: &str) -> Url {
        let mut link = self.verify_url.clone();
        link.query_pairs_mut()
            .append_pair("email_id", &email_id.to_string())
            .append_pair("secret_code", secret_code);
        link
    }
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), TaskError> {
        let payload: PayloadSendVerifyEmail = envelope
            .payload_json()
            .map_err(|e| TaskError::skip_retry(anyhow::Error::new(e).context("failed to decode payload")))?;

        // The user row may not be committed yet when the task first runs, so
        // a missing user is retried.
        let user = self
            .store
            .get_user(payload.user_id)
            .await
            .with_context(|| format!("failed to get user {}", payload.user_id))?;

        let record = self
            .store
            .create_verify_email(CreateVerifyEmail {
                user_id: user.id,
                email: user.email.clone(),
                secret_code: random_string(SECRET_CODE_LENGTH),
            })
            .await
            .context("failed to create verify email")?;

        let link = self.verify_link(record.id, &record.secret_code);
        let email = Email {
            to: vec![user.email.clone()],
            subject: "Welcome to Simple Bank".to_string(),
            html: format!(
                "Hello {},<br/>\n\
                 Thank you for registering with us!<br/>\n\
                 Please <a href=\"{}\">click here</a> to verify your email address.<br/>\n",
                escape_html(&user.full_name),
                link
            ),
            ..Email::default()
        };

        self.mailer
            .send(&email)
            .await
            .context("failed to send verify email")?;

        info!(
            user_id = user.id,
            email = %user.email,
            verify_email_id = record.id,
            "verify_email_sent"
        );
        Ok(())
    }
}

fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
