use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    message::{NotificationType, Priority, Recipient, partition_key},
    status::OutboxStatus,
    template::TemplateContext,
};

/// An outbox row: a notification that a committed business change asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub id: Uuid,
    pub notification_type: NotificationType,
    pub template: String,
    pub template_context: TemplateContext,
    pub recipients: Vec<Recipient>,
    pub backends: Vec<String>,
    pub correlation_key: Option<String>,
    pub priority: Priority,
    pub status: OutboxStatus,
    pub publish_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl NotificationIntent {
    pub fn new(
        notification_type: NotificationType,
        template: impl Into<String>,
        template_context: TemplateContext,
        recipients: Vec<Recipient>,
        backends: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type,
            template: template.into(),
            template_context,
            recipients,
            backends,
            correlation_key: None,
            priority: Priority::Normal,
            status: OutboxStatus::Pending,
            publish_attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            published_at: None,
        }
    }

    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn partition_key(&self) -> String {
        partition_key(self.correlation_key.as_deref(), &self.recipients, self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: i64,
    pub published: i64,
    pub failed: i64,
}
