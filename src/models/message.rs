use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use anyhow::{Error, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{retry::RetryState, template::TemplateContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Email,
    DocumentApproved,
    ReviewRequested,
    NewOwner,
    DocumentPublished,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Email => "email",
            NotificationType::DocumentApproved => "document_approved",
            NotificationType::ReviewRequested => "review_requested",
            NotificationType::NewOwner => "new_owner",
            NotificationType::DocumentPublished => "document_published",
        }
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(NotificationType::Email),
            "document_approved" => Ok(NotificationType::DocumentApproved),
            "review_requested" => Ok(NotificationType::ReviewRequested),
            "new_owner" => Ok(NotificationType::NewOwner),
            "document_published" => Ok(NotificationType::DocumentPublished),
            other => Err(anyhow!("Unknown notification type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_i16(&self) -> i16 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
            Priority::Urgent => 2,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            i16::MIN..=0 => Priority::Normal,
            1 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Per-backend channel identifiers, e.g. `{"slack": "U024BE7LH"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channel_ids: BTreeMap<String, String>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
            channel_ids: BTreeMap::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_channel_id(mut self, backend: impl Into<String>, id: impl Into<String>) -> Self {
        self.channel_ids.insert(backend.into(), id.into());
        self
    }

    pub fn channel_id(&self, backend: &str) -> Option<&str> {
        self.channel_ids.get(backend).map(String::as_str)
    }

    /// `Name <address>` when a display name is present.
    pub fn formatted(&self) -> String {
        match &self.display_name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.address),
            _ => self.address.clone(),
        }
    }
}

/// The part of a notification that only ever travels encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivePayload {
    pub recipients: Vec<Recipient>,
    pub template: String,
    pub template_context: TemplateContext,
}

impl SensitivePayload {
    /// Canonical bytes the dedup key is derived from. Ids and timestamps are
    /// not part of it, so logically identical re-sends collapse onto the same
    /// key.
    pub fn dedup_material(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&serde_json::json!({
            "template": self.template,
            "recipients": self.recipients,
            "template_context": self.template_context,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,

    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    pub partition_key: String,
    pub dedup_key: String,
    pub backends: Vec<String>,
    pub encrypted_payload: String,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Set on the first failed attempt and carried unchanged through retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_backends: Vec<String>,
}

impl NotificationMessage {
    pub fn is_retry(&self) -> bool {
        self.retry_count > 0
    }

    /// Associated data sealed with the payload: the id bytes followed by the
    /// dedup key.
    pub fn associated_data(&self) -> Vec<u8> {
        associated_data(self.id, &self.dedup_key)
    }

    pub fn retry_state(&self) -> RetryState {
        RetryState {
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            last_retry_at: self.last_retry_at,
            next_retry_at: self.next_retry_at,
        }
    }

    /// Copies the message forward for re-publication. Only the backends that
    /// failed are carried, so backends that already succeeded are not invoked
    /// again.
    pub fn for_retry(&self, state: RetryState, failed_backends: Vec<String>) -> Self {
        Self {
            backends: failed_backends.clone(),
            failed_backends,
            retry_count: state.retry_count,
            last_error: state.last_error,
            last_retry_at: state.last_retry_at,
            next_retry_at: state.next_retry_at,
            first_failure_at: self.first_failure_at.or(state.last_retry_at),
            ..self.clone()
        }
    }
}

pub fn associated_data(id: Uuid, dedup_key: &str) -> Vec<u8> {
    let mut aad = id.as_bytes().to_vec();
    aad.extend_from_slice(dedup_key.as_bytes());
    aad
}

/// Chooses the ordering domain for a message: the correlation key, then the
/// primary recipient, then the message id.
pub fn partition_key(correlation_key: Option<&str>, recipients: &[Recipient], id: Uuid) -> String {
    if let Some(key) = correlation_key.filter(|k| !k.trim().is_empty()) {
        return key.to_string();
    }

    if let Some(first) = recipients.first().filter(|r| !r.address.trim().is_empty()) {
        let digest = Sha256::digest(first.address.trim().to_lowercase().as_bytes());
        return format!("recipient:{}", &hex::encode(digest)[..32]);
    }

    id.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_message: NotificationMessage,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    pub first_failure_at: DateTime<Utc>,
    pub retry_count: u32,
    pub failed_backends: Vec<String>,
    pub message_id: Uuid,
    pub notification_type: NotificationType,
}

impl DeadLetterRecord {
    pub fn new(
        message: NotificationMessage,
        failure_reason: impl Into<String>,
        failed_backends: Vec<String>,
    ) -> Self {
        let now = Utc::now();

        Self {
            failure_reason: failure_reason.into(),
            failed_at: now,
            first_failure_at: message.first_failure_at.unwrap_or(now),
            retry_count: message.retry_count,
            failed_backends,
            message_id: message.id,
            notification_type: message.notification_type,
            original_message: message,
        }
    }
}
