use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use tracing::info;

use crate::{
    backends::{BackendHandler, Delivery},
    clients::database::insert_audit_entry,
    error::BackendError,
    models::audit::CreateAuditLog,
};

const NAME: &str = "audit";

/// Records that a notification was delivered. Always logs; also writes a row
/// to `notification_audit_log` when a pool is configured.
pub struct AuditHandler {
    pool: Option<PgPool>,
}

impl AuditHandler {
    pub fn new(pool: Option<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackendHandler for AuditHandler {
    fn name(&self) -> &str {
        NAME
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), BackendError> {
        let message = &delivery.message;

        info!(
            message_id = %message.id,
            notification_type = %message.notification_type,
            template = %delivery.payload.template,
            correlation_key = message.correlation_key.as_deref().unwrap_or(""),
            recipient_count = delivery.payload.recipients.len(),
            backends = ?message.backends,
            retry_count = message.retry_count,
            "Notification audit"
        );

        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let entry = CreateAuditLog::new(
            message.id,
            message.notification_type,
            delivery.payload.template.clone(),
            delivery.payload.recipients.len(),
        )
        .with_correlation_key(message.correlation_key.clone())
        .with_backends(message.backends.clone())
        .with_retry_count(message.retry_count)
        .with_metadata(json!({
            "subject": delivery.rendered.subject,
            "priority": message.priority,
        }));

        insert_audit_entry(pool, &entry)
            .await
            .map_err(|e| BackendError::retryable(NAME, "insert", e.to_string()))
    }
}
