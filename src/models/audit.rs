use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::message::NotificationType;

#[derive(Debug, Clone, Serialize)]
pub struct CreateAuditLog {
    pub message_id: Uuid,
    pub notification_type: NotificationType,
    pub template: String,
    pub correlation_key: Option<String>,
    pub recipient_count: i32,
    pub backends: Vec<String>,
    pub retry_count: i32,
    pub metadata: JsonValue,
}

impl CreateAuditLog {
    pub fn new(
        message_id: Uuid,
        notification_type: NotificationType,
        template: String,
        recipient_count: usize,
    ) -> Self {
        Self {
            message_id,
            notification_type,
            template,
            correlation_key: None,
            recipient_count: i32::try_from(recipient_count).unwrap_or(i32::MAX),
            backends: Vec::new(),
            retry_count: 0,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_correlation_key(mut self, key: Option<String>) -> Self {
        self.correlation_key = key;
        self
    }

    pub fn with_backends(mut self, backends: Vec<String>) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = i32::try_from(retry_count).unwrap_or(i32::MAX);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}
