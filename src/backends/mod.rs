//! Delivery backends. A handler turns one rendered notification into calls
//! against an external channel and classifies any failure as retryable or
//! permanent.

pub mod audit;
pub mod chat;
pub mod mail;
pub mod ntfy;

use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use sqlx::PgPool;
use tracing::info;

use crate::{
    config::Config,
    error::BackendError,
    models::{
        message::{NotificationMessage, SensitivePayload},
        template::RenderedContent,
    },
};

pub use audit::AuditHandler;
pub use chat::{ChatHandler, ChatPlatform};
pub use mail::{MailConfig, MailHandler};
pub use ntfy::{NtfyConfig, NtfyHandler};

/// Everything a handler needs for one message: the wire envelope, the
/// decrypted payload and the rendered content.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: NotificationMessage,
    pub payload: SensitivePayload,
    pub rendered: RenderedContent,
}

#[async_trait]
pub trait BackendHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this handler serves the backend name carried in a message.
    fn supports_backend(&self, backend: &str) -> bool {
        backend == self.name()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), BackendError>;
}

pub fn find_handler<'a>(
    handlers: &'a [Arc<dyn BackendHandler>],
    backend: &str,
) -> Option<&'a Arc<dyn BackendHandler>> {
    handlers.iter().find(|h| h.supports_backend(backend))
}

pub(crate) fn http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))
}

/// Builds the handlers whose settings are present in `config`.
pub fn build_handlers(
    config: &Config,
    pool: Option<PgPool>,
) -> Result<Vec<Arc<dyn BackendHandler>>, Error> {
    let mut handlers: Vec<Arc<dyn BackendHandler>> = Vec::new();

    if let (Some(api_url), Some(api_key), Some(from_address)) = (
        &config.mail_api_url,
        &config.mail_api_key,
        &config.mail_from_address,
    ) {
        handlers.push(Arc::new(MailHandler::new(MailConfig {
            api_url: api_url.clone(),
            api_key: api_key.clone(),
            from_address: from_address.clone(),
            from_name: config.mail_from_name.clone(),
        })?));
    }

    if let Some(token) = &config.slack_bot_token {
        handlers.push(Arc::new(ChatHandler::slack(
            &config.slack_api_url,
            token.clone(),
        )?));
    }

    if let Some(webhook_url) = &config.discord_webhook_url {
        handlers.push(Arc::new(ChatHandler::discord(webhook_url)?));
    }

    if let Some(topic) = &config.ntfy_topic {
        handlers.push(Arc::new(NtfyHandler::new(NtfyConfig {
            server_url: config.ntfy_server_url.clone(),
            topic: topic.clone(),
            access_token: config.ntfy_access_token.clone(),
        })?));
    }

    if config.audit_enabled {
        handlers.push(Arc::new(AuditHandler::new(pool)));
    }

    info!(
        handlers = ?handlers.iter().map(|h| h.name().to_string()).collect::<Vec<_>>(),
        "Backend handlers configured"
    );

    Ok(handlers)
}
