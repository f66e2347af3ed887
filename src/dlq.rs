use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        rbmq::{Broker, DeadLetterDelivery, DeadLetterQueue},
        redis::DedupStore,
    },
    models::{
        message::{DeadLetterRecord, NotificationMessage, NotificationType},
        retry::RetryConfig,
    },
    producer::{MessageBuilder, NotificationRequest, Producer},
    utils::retry_with_backoff,
};

/// Append-only writer for terminally failed messages.
#[derive(Clone)]
pub struct DeadLetterPublisher {
    broker: Arc<dyn Broker>,
    dedup: Arc<dyn DedupStore>,
    retry_config: RetryConfig,
}

impl DeadLetterPublisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        dedup: Arc<dyn DedupStore>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            broker,
            dedup,
            retry_config,
        }
    }

    /// Writes the record, then releases the message's dedup claim so a later
    /// replay or deliberate re-send is not swallowed as a duplicate.
    pub async fn dead_letter(
        &self,
        message: NotificationMessage,
        reason: &str,
        failed_backends: Vec<String>,
    ) -> Result<(), Error> {
        let dedup_key = message.dedup_key.clone();
        let message_id = message.id;
        let record = DeadLetterRecord::new(message, reason, failed_backends);
        let payload = serde_json::to_vec(&record)?;

        self.publish_with_retry(&payload).await?;

        error!(
            message_id = %record.message_id,
            notification_type = %record.notification_type,
            retry_count = record.retry_count,
            failed_backends = ?record.failed_backends,
            failure_reason = %record.failure_reason,
            "Message moved to dead-letter queue"
        );

        if let Err(e) = self.dedup.release(&dedup_key, message_id).await {
            warn!(
                message_id = %record.message_id,
                error = %e,
                "Failed to release dedup claim for dead-lettered message"
            );
        }

        Ok(())
    }

    /// Parks a payload that could not even be decoded as a message.
    pub async fn quarantine(&self, payload: &[u8], reason: &str) -> Result<(), Error> {
        self.publish_with_retry(payload).await?;

        error!(
            bytes = payload.len(),
            failure_reason = reason,
            "Undecodable payload moved to dead-letter queue"
        );

        Ok(())
    }

    async fn publish_with_retry(&self, payload: &[u8]) -> Result<(), Error> {
        retry_with_backoff(&self.retry_config, || {
            let broker = self.broker.clone();
            async move { broker.publish_dead_letter(payload).await }
        })
        .await
        .map_err(|e| anyhow!("Failed to publish to dead-letter queue: {}", e))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterSummary {
    pub message_id: Option<Uuid>,
    pub notification_type: Option<NotificationType>,
    pub failure_reason: String,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub failed_backends: Vec<String>,
    pub correlation_key: Option<String>,
}

impl DeadLetterSummary {
    fn from_record(record: &DeadLetterRecord) -> Self {
        Self {
            message_id: Some(record.message_id),
            notification_type: Some(record.notification_type),
            failure_reason: record.failure_reason.clone(),
            failed_at: Some(record.failed_at),
            retry_count: record.retry_count,
            failed_backends: record.failed_backends.clone(),
            correlation_key: record.original_message.correlation_key.clone(),
        }
    }

    fn unreadable(error: &serde_json::Error) -> Self {
        Self {
            message_id: None,
            notification_type: None,
            failure_reason: format!("unreadable entry: {}", error),
            failed_at: None,
            retry_count: 0,
            failed_backends: Vec::new(),
            correlation_key: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Replay only this entry. `None` replays everything.
    pub message_id: Option<Uuid>,
    pub limit: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    /// `(dead-lettered id, new intent id)`. The new id is nil on a dry run.
    pub replayed: Vec<(Uuid, Uuid)>,
    /// `(entry id if readable, reason)`
    pub failed: Vec<(Option<Uuid>, String)>,
    pub skipped: usize,
}

/// Operator tooling over the dead-letter queue.
pub struct Replayer {
    queue: Arc<dyn DeadLetterQueue>,
    dedup: Arc<dyn DedupStore>,
    builder: MessageBuilder,
    producer: Producer,
}

impl Replayer {
    pub fn new(
        queue: Arc<dyn DeadLetterQueue>,
        dedup: Arc<dyn DedupStore>,
        builder: MessageBuilder,
        producer: Producer,
    ) -> Self {
        Self {
            queue,
            dedup,
            builder,
            producer,
        }
    }

    /// Reads up to `limit` entries without consuming them.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterSummary>, Error> {
        let mut held = Vec::new();
        let mut summaries = Vec::new();

        while summaries.len() < limit {
            let Some(delivery) = self.queue.fetch().await? else {
                break;
            };

            summaries.push(
                match serde_json::from_slice::<DeadLetterRecord>(&delivery.payload) {
                    Ok(record) => DeadLetterSummary::from_record(&record),
                    Err(e) => DeadLetterSummary::unreadable(&e),
                },
            );
            held.push(delivery.delivery_tag);
        }

        self.requeue_all(&held).await?;
        Ok(summaries)
    }

    /// Re-injects dead letters as fresh intents: a new id, no retry state, the
    /// same correlation key, and only the backends that were still failing.
    /// Entries that are not replayed go back on the queue.
    pub async fn replay(&self, options: &ReplayOptions) -> Result<ReplayReport, Error> {
        let mut report = ReplayReport::default();
        let mut held = Vec::new();
        let mut attempted = 0usize;

        while options.limit.is_none_or(|limit| attempted < limit) {
            let Some(delivery) = self.queue.fetch().await? else {
                break;
            };

            let record = match serde_json::from_slice::<DeadLetterRecord>(&delivery.payload) {
                Ok(record) => record,
                Err(e) => {
                    if options.message_id.is_none() {
                        report.failed.push((None, format!("unreadable entry: {}", e)));
                    } else {
                        report.skipped += 1;
                    }
                    held.push(delivery.delivery_tag);
                    continue;
                }
            };

            if options
                .message_id
                .is_some_and(|id| id != record.message_id)
            {
                report.skipped += 1;
                held.push(delivery.delivery_tag);
                continue;
            }

            attempted += 1;
            match self.replay_one(&delivery, &record, options.dry_run).await {
                Ok(new_id) => {
                    report.replayed.push((record.message_id, new_id));
                    if options.dry_run {
                        held.push(delivery.delivery_tag);
                    }
                }
                Err(e) => {
                    warn!(message_id = %record.message_id, error = %e, "Dead letter not replayed");
                    report.failed.push((Some(record.message_id), e.to_string()));
                    held.push(delivery.delivery_tag);
                }
            }

            if options.message_id.is_some() {
                break;
            }
        }

        self.requeue_all(&held).await?;

        info!(
            replayed = report.replayed.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            dry_run = options.dry_run,
            "Dead-letter replay finished"
        );

        Ok(report)
    }

    async fn replay_one(
        &self,
        delivery: &DeadLetterDelivery,
        record: &DeadLetterRecord,
        dry_run: bool,
    ) -> Result<Uuid, Error> {
        let original = &record.original_message;
        let payload = self.builder.open(original)?;

        // Backends that already delivered are not invoked again.
        let backends = if record.failed_backends.is_empty() {
            original.backends.clone()
        } else {
            record.failed_backends.clone()
        };

        let mut request = NotificationRequest::new(original.notification_type, payload.template)
            .with_context(payload.template_context)
            .recipients(payload.recipients)
            .backends(backends)
            .priority(original.priority);

        if let Some(key) = &original.correlation_key {
            request = request.correlation_key(key.clone());
        }

        if dry_run {
            self.producer.prepare(request)?;
            return Ok(Uuid::nil());
        }

        self.dedup.release(&original.dedup_key, original.id).await?;
        let new_id = self.producer.publish(request).await?;
        self.queue.ack(delivery.delivery_tag).await?;

        info!(
            message_id = %record.message_id,
            new_intent_id = %new_id,
            "Dead letter replayed"
        );

        Ok(new_id)
    }

    async fn requeue_all(&self, tags: &[u64]) -> Result<(), Error> {
        // Reverse order keeps the queue's original ordering for push-front requeues.
        for tag in tags.iter().rev() {
            self.queue.requeue(*tag).await?;
        }
        Ok(())
    }
}
