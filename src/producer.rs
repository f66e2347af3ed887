use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{
    clients::database::{OutboxStore, write_intent},
    crypto::PayloadCipher,
    error::{CryptoError, ProducerError},
    models::{
        intent::NotificationIntent,
        message::{
            NotificationMessage, NotificationType, Priority, Recipient, SensitivePayload,
            associated_data,
        },
        template::TemplateContext,
        validation::{validate_backend_name, validate_email_address, validate_recipient},
    },
    template::TemplateEngine,
};

/// Turns outbox intents into wire messages and back.
#[derive(Clone)]
pub struct MessageBuilder {
    cipher: PayloadCipher,
    templates: Arc<TemplateEngine>,
}

impl MessageBuilder {
    pub fn new(cipher: PayloadCipher, templates: Arc<TemplateEngine>) -> Self {
        Self { cipher, templates }
    }

    pub fn templates(&self) -> &TemplateEngine {
        &self.templates
    }

    /// Sanitizes the context, derives the keyed dedup key from the cleartext
    /// payload and seals the payload with the message id and dedup key as
    /// associated data.
    pub fn build(&self, intent: &NotificationIntent) -> Result<NotificationMessage, ProducerError> {
        if intent.backends.is_empty() {
            return Err(ProducerError::NoBackends);
        }
        if intent.recipients.is_empty() {
            return Err(ProducerError::NoRecipients);
        }

        let template_context = self
            .templates
            .sanitize(&intent.template, &intent.template_context)?;

        let payload = SensitivePayload {
            recipients: intent.recipients.clone(),
            template: intent.template.clone(),
            template_context,
        };

        let dedup_key = self.dedup_key(&payload)?;
        let encrypted_payload = self
            .cipher
            .seal_json(&payload, &associated_data(intent.id, &dedup_key))?;

        Ok(NotificationMessage {
            id: intent.id,
            notification_type: intent.notification_type,
            timestamp: Utc::now(),
            priority: intent.priority,
            correlation_key: intent.correlation_key.clone(),
            partition_key: intent.partition_key(),
            dedup_key,
            backends: intent.backends.clone(),
            encrypted_payload,
            retry_count: 0,
            last_error: None,
            last_retry_at: None,
            next_retry_at: None,
            first_failure_at: None,
            failed_backends: Vec::new(),
        })
    }

    pub fn dedup_key(&self, payload: &SensitivePayload) -> Result<String, ProducerError> {
        Ok(self.cipher.dedup_digest(&payload.dedup_material()?))
    }

    pub fn open(&self, message: &NotificationMessage) -> Result<SensitivePayload, CryptoError> {
        self.cipher
            .open_json(&message.encrypted_payload, &message.associated_data())
    }

    /// Authenticates the envelope, including its dedup key, without decoding
    /// the payload.
    pub fn verify(&self, message: &NotificationMessage) -> Result<(), CryptoError> {
        self.cipher
            .verify(&message.encrypted_payload, &message.associated_data())
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub notification_type: NotificationType,
    pub template: String,
    pub template_context: TemplateContext,
    pub recipients: Vec<Recipient>,
    pub backends: Vec<String>,
    pub correlation_key: Option<String>,
    pub priority: Priority,
}

impl NotificationRequest {
    pub fn new(notification_type: NotificationType, template: impl Into<String>) -> Self {
        Self {
            notification_type,
            template: template.into(),
            template_context: TemplateContext::new(),
            recipients: Vec::new(),
            backends: Vec::new(),
            correlation_key: None,
            priority: Priority::Normal,
        }
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.template_context.insert(key.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: TemplateContext) -> Self {
        self.template_context = context;
        self
    }

    pub fn recipient(mut self, recipient: Recipient) -> Self {
        self.recipients.push(recipient);
        self
    }

    pub fn recipients(mut self, recipients: Vec<Recipient>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backends.push(backend.into());
        self
    }

    pub fn backends(mut self, backends: Vec<String>) -> Self {
        self.backends = backends;
        self
    }

    pub fn correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Producer API. Requests are validated and written to the outbox; delivery
/// happens later through the relay, so nothing here waits on a backend.
pub struct Producer {
    outbox: Arc<dyn OutboxStore>,
    templates: Arc<TemplateEngine>,
}

impl Producer {
    pub fn new(outbox: Arc<dyn OutboxStore>, templates: Arc<TemplateEngine>) -> Self {
        Self { outbox, templates }
    }

    pub async fn publish_notification(
        &self,
        notification_type: NotificationType,
        template: &str,
        template_context: TemplateContext,
        recipients: Vec<Recipient>,
        backends: Vec<String>,
    ) -> Result<Uuid, ProducerError> {
        self.publish(
            NotificationRequest::new(notification_type, template)
                .with_context(template_context)
                .recipients(recipients)
                .backends(backends),
        )
        .await
    }

    pub async fn publish(&self, request: NotificationRequest) -> Result<Uuid, ProducerError> {
        let intent = self.prepare(request)?;
        let id = self.outbox.insert(&intent).await?;

        info!(
            intent_id = %id,
            notification_type = %intent.notification_type,
            "Notification queued"
        );

        Ok(id)
    }

    /// Writes the intent inside the caller's transaction, so it commits or
    /// rolls back with the business change.
    pub async fn publish_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: NotificationRequest,
    ) -> Result<Uuid, ProducerError> {
        let intent = self.prepare(request)?;
        Ok(write_intent(tx, &intent).await?)
    }

    pub fn prepare(&self, request: NotificationRequest) -> Result<NotificationIntent, ProducerError> {
        self.validate(&request)?;

        let template_context = self
            .templates
            .sanitize(&request.template, &request.template_context)?;

        let mut intent = NotificationIntent::new(
            request.notification_type,
            request.template,
            template_context,
            request.recipients,
            request.backends,
        )
        .with_priority(request.priority);

        if let Some(key) = request.correlation_key {
            intent = intent.with_correlation_key(key);
        }

        Ok(intent)
    }

    fn validate(&self, request: &NotificationRequest) -> Result<(), ProducerError> {
        if request.backends.is_empty() {
            return Err(ProducerError::NoBackends);
        }
        if request.recipients.is_empty() {
            return Err(ProducerError::NoRecipients);
        }

        for backend in &request.backends {
            validate_backend_name(backend)
                .map_err(|e| ProducerError::Validation(e.to_string()))?;
        }

        let wants_email = request
            .backends
            .iter()
            .any(|b| b == "mail" || b == "email");

        for recipient in &request.recipients {
            validate_recipient(recipient).map_err(|e| ProducerError::Validation(e.to_string()))?;

            if wants_email {
                validate_email_address(&recipient.address)
                    .map_err(|e| ProducerError::Validation(e.to_string()))?;
            }
        }

        Ok(())
    }
}
