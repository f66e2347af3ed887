use anyhow::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::{
    backends::{BackendHandler, Delivery, http_client},
    error::BackendError,
};

const NAME: &str = "mail";

#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Base URL of the mail API; messages go to `{api_url}/emails`.
    pub api_url: String,
    pub api_key: String,
    pub from_address: String,
    pub from_name: Option<String>,
}

/// Sends email through an HTTP mail API, one request per recipient so
/// recipients never see each other's addresses.
///
/// A retryable failure part way through fails the whole backend. The retry
/// sends again to every recipient, including those already mailed.
pub struct MailHandler {
    client: Client,
    config: MailConfig,
}

impl MailHandler {
    pub fn new(config: MailConfig) -> Result<Self, Error> {
        info!(api_url = %config.api_url, "Mail handler initialized");

        Ok(Self {
            client: http_client()?,
            config,
        })
    }

    fn from_header(&self) -> String {
        match &self.config.from_name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.config.from_address),
            _ => self.config.from_address.clone(),
        }
    }

    async fn send_one(&self, to: &str, delivery: &Delivery) -> Result<(), BackendError> {
        let url = format!("{}/emails", self.config.api_url.trim_end_matches('/'));

        let body = json!({
            "from": self.from_header(),
            "to": [to],
            "subject": delivery.rendered.subject,
            "text": delivery.rendered.body_text,
            "html": delivery.rendered.body_html,
            "headers": {
                "X-Notification-Id": delivery.message.id.to_string(),
            },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(NAME, "send", &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(NAME, "send", status.as_u16(), &text))
    }
}

#[async_trait]
impl BackendHandler for MailHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn supports_backend(&self, backend: &str) -> bool {
        backend == "mail" || backend == "email"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), BackendError> {
        let recipients: Vec<String> = delivery
            .payload
            .recipients
            .iter()
            .filter(|r| !r.address.trim().is_empty())
            .map(|r| r.formatted())
            .collect();

        if recipients.is_empty() {
            return Err(BackendError::permanent(
                NAME,
                "prepare",
                "no email recipients found in notification",
            ));
        }

        let total = recipients.len();
        for (idx, to) in recipients.iter().enumerate() {
            self.send_one(to, delivery)
                .await
                .map_err(|e| e.for_recipient(idx + 1, total))?;
        }

        debug!(
            message_id = %delivery.message.id,
            recipient_count = recipients.len(),
            "Email sent"
        );

        Ok(())
    }
}
