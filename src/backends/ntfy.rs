use anyhow::{Error, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{Client, header::HeaderValue};
use tracing::{debug, info};

use crate::{
    backends::{BackendHandler, Delivery, http_client},
    error::BackendError,
    models::message::Priority,
};

const NAME: &str = "ntfy";

#[derive(Debug, Clone)]
pub struct NtfyConfig {
    /// e.g. `https://ntfy.sh`
    pub server_url: String,
    pub topic: String,
    pub access_token: Option<String>,
}

/// Publishes a push notification to one ntfy topic. The topic is the
/// audience, so recipients on the message are not addressed individually.
pub struct NtfyHandler {
    client: Client,
    url: String,
    access_token: Option<String>,
}

/// ntfy priorities run from 1 (min) to 5 (max), 3 being the default.
fn ntfy_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::Normal => "3",
        Priority::High => "4",
        Priority::Urgent => "5",
    }
}

/// Plain ASCII goes as is; anything else as an RFC 2047 encoded word.
fn title_header(subject: &str) -> Option<HeaderValue> {
    if subject.is_empty() {
        return None;
    }

    HeaderValue::from_str(subject)
        .ok()
        .filter(|_| subject.is_ascii())
        .or_else(|| {
            HeaderValue::from_str(&format!("=?UTF-8?B?{}?=", STANDARD.encode(subject))).ok()
        })
}

impl NtfyHandler {
    pub fn new(config: NtfyConfig) -> Result<Self, Error> {
        let url = format!(
            "{}/{}",
            config.server_url.trim_end_matches('/'),
            config.topic.trim_start_matches('/')
        );

        info!(server_url = %config.server_url, topic = %config.topic, "ntfy handler initialized");

        Ok(Self {
            client: http_client()?,
            url,
            access_token: config.access_token,
        })
    }
}

#[async_trait]
impl BackendHandler for NtfyHandler {
    fn name(&self) -> &str {
        NAME
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), BackendError> {
        let body = match delivery.rendered.body_text.trim() {
            "" => format!("Notification: {}", delivery.message.notification_type),
            text => text.to_string(),
        };

        let mut request = self
            .client
            .post(&self.url)
            .header("Priority", ntfy_priority(delivery.message.priority))
            .header("Tags", delivery.message.notification_type.as_str())
            .body(body);

        if let Some(title) = title_header(&delivery.rendered.subject) {
            request = request.header("Title", title);
        }

        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::from_transport(NAME, "send", &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(NAME, "send", status.as_u16(), &text));
        }

        debug!(message_id = %delivery.message.id, "ntfy notification published");

        Ok(())
    }
}
