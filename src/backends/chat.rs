use anyhow::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{
    backends::{BackendHandler, Delivery, http_client},
    error::BackendError,
};

/// Discord rejects message content past this length.
const DISCORD_CONTENT_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPlatform {
    Slack,
    Discord,
}

impl ChatPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatPlatform::Slack => "slack",
            ChatPlatform::Discord => "discord",
        }
    }
}

/// Slack Web API response envelope. Slack reports most failures with a 200
/// status and `ok: false`.
#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Slack errors that clear up on their own.
fn is_retryable_slack_error(error: &str) -> bool {
    matches!(
        error,
        "ratelimited" | "service_unavailable" | "internal_error" | "fatal_error" | "request_timeout"
    )
}

/// Slack mrkdwn control characters. `<...>` would otherwise open mentions
/// such as `<!channel>` or relabelled links.
pub fn escape_slack(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Posts to a chat platform. Recipients are addressed by the channel id they
/// carry for this platform; recipients without one are skipped.
///
/// Posts go out one recipient at a time. A retryable failure part way through
/// fails the whole backend, so the retry posts again to recipients that were
/// already reached.
pub struct ChatHandler {
    platform: ChatPlatform,
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl ChatHandler {
    pub fn slack(api_url: &str, bot_token: String) -> Result<Self, Error> {
        info!(api_url, "Slack handler initialized");

        Ok(Self {
            platform: ChatPlatform::Slack,
            client: http_client()?,
            endpoint: format!("{}/chat.postMessage", api_url.trim_end_matches('/')),
            token: Some(bot_token),
        })
    }

    pub fn discord(webhook_url: &str) -> Result<Self, Error> {
        info!("Discord handler initialized");

        Ok(Self {
            platform: ChatPlatform::Discord,
            client: http_client()?,
            endpoint: webhook_url.to_string(),
            token: None,
        })
    }

    pub fn platform(&self) -> ChatPlatform {
        self.platform
    }

    fn text(delivery: &Delivery) -> String {
        format!(
            "*{}*\n\n{}",
            delivery.rendered.subject,
            delivery.rendered.body_text.trim_end()
        )
    }

    fn slack_text(delivery: &Delivery) -> String {
        format!(
            "*{}*\n\n{}",
            escape_slack(&delivery.rendered.subject),
            escape_slack(delivery.rendered.body_text.trim_end())
        )
    }

    fn build_payload(&self, channel_id: &str, delivery: &Delivery) -> Value {
        match self.platform {
            ChatPlatform::Slack => json!({
                "channel": channel_id,
                "text": Self::slack_text(delivery),
                "unfurl_links": false,
            }),
            ChatPlatform::Discord => {
                let mut content = format!("<@{}> {}", channel_id, Self::text(delivery));
                if let Some((idx, _)) = content.char_indices().nth(DISCORD_CONTENT_LIMIT) {
                    content.truncate(idx);
                }
                json!({
                    "content": content,
                    "allowed_mentions": { "users": [channel_id] },
                })
            }
        }
    }

    async fn post(&self, payload: &Value) -> Result<(), BackendError> {
        let name = self.platform.as_str();

        let mut request = self.client.post(&self.endpoint).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::from_transport(name, "post", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(name, "post", status.as_u16(), &body));
        }

        if self.platform == ChatPlatform::Slack {
            let body: SlackResponse = response.json().await.map_err(|e| {
                BackendError::retryable(name, "post", format!("unreadable response: {}", e))
            })?;

            if !body.ok {
                let error = body.error.unwrap_or_else(|| "unknown_error".to_string());
                return Err(if is_retryable_slack_error(&error) {
                    BackendError::retryable(name, "post", error)
                } else {
                    BackendError::permanent(name, "post", error)
                });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BackendHandler for ChatHandler {
    fn name(&self) -> &str {
        self.platform.as_str()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), BackendError> {
        let name = self.platform.as_str();

        let channel_ids: Vec<&str> = delivery
            .payload
            .recipients
            .iter()
            .filter_map(|r| r.channel_id(name))
            .collect();

        if channel_ids.is_empty() {
            return Err(BackendError::permanent(
                name,
                "prepare",
                format!("no recipient has a {} channel id", name),
            ));
        }

        let total = channel_ids.len();
        for (idx, channel_id) in channel_ids.iter().enumerate() {
            self.post(&self.build_payload(channel_id, delivery))
                .await
                .map_err(|e| e.for_recipient(idx + 1, total))?;
        }

        debug!(
            message_id = %delivery.message.id,
            backend = name,
            recipient_count = channel_ids.len(),
            "Chat message posted"
        );

        Ok(())
    }
}
