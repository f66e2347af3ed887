use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{Error, Result};
use chrono::{TimeDelta, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        database::OutboxStore,
        rbmq::{Broker, Topic},
    },
    config::Config,
    models::{
        intent::{NotificationIntent, OutboxStats},
        status::OutboxStatus,
    },
    producer::MessageBuilder,
};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub claim_lease: Duration,
    pub max_publish_attempts: i32,
}

impl RelayConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.relay_poll_interval_secs),
            batch_size: config.relay_batch_size,
            claim_lease: Duration::from_secs(config.relay_claim_lease_secs),
            max_publish_attempts: config.relay_max_publish_attempts,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            claim_lease: Duration::from_secs(60),
            max_publish_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    /// Publish failed; the row stays pending for another attempt.
    pub deferred: usize,
    pub failed: usize,
    /// Not attempted because an earlier row with the same partition key
    /// failed to publish in this batch.
    pub skipped: usize,
}

/// Moves committed outbox rows onto the broker's main topic.
pub struct Relay {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    builder: MessageBuilder,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        builder: MessageBuilder,
        config: RelayConfig,
    ) -> Self {
        Self {
            outbox,
            broker,
            builder,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backlog = false;

        loop {
            if !backlog {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            } else if cancel.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        info!(
                            claimed = report.claimed,
                            published = report.published,
                            deferred = report.deferred,
                            failed = report.failed,
                            skipped = report.skipped,
                            "Outbox batch relayed"
                        );
                    }
                    // A full batch that made progress means more rows are likely waiting.
                    backlog = i64::try_from(report.claimed).unwrap_or(i64::MAX)
                        >= self.config.batch_size
                        && report.published > 0;
                }
                Err(e) => {
                    warn!(error = %e, "Outbox relay batch failed");
                    backlog = false;
                }
            }
        }

        info!("Outbox relay stopped");
        Ok(())
    }

    /// Claims one batch and publishes it in `created_at` order. Once a row
    /// fails to publish, later rows sharing its partition key are left for
    /// the next poll so they cannot overtake it.
    pub async fn process_batch(&self) -> Result<BatchReport, Error> {
        let intents = self
            .outbox
            .claim_pending(self.config.batch_size, self.config.claim_lease)
            .await?;

        let mut report = BatchReport {
            claimed: intents.len(),
            ..Default::default()
        };

        let mut blocked_keys: HashSet<String> = HashSet::new();
        let mut skipped: Vec<Uuid> = Vec::new();

        for intent in &intents {
            let partition_key = intent.partition_key();

            if blocked_keys.contains(&partition_key) {
                skipped.push(intent.id);
                continue;
            }

            match self.relay_one(intent).await? {
                OutboxStatus::Published => report.published += 1,
                OutboxStatus::Pending => {
                    report.deferred += 1;
                    blocked_keys.insert(partition_key);
                }
                OutboxStatus::Failed => report.failed += 1,
            }
        }

        report.skipped = skipped.len();
        self.outbox.release_claims(&skipped).await?;

        Ok(report)
    }

    async fn relay_one(&self, intent: &NotificationIntent) -> Result<OutboxStatus, Error> {
        let message = match self.builder.build(intent) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    intent_id = %intent.id,
                    notification_type = %intent.notification_type,
                    error = %e,
                    "Outbox row cannot be turned into a message, marking failed"
                );
                self.outbox.mark_failed(intent.id, &e.to_string()).await?;
                return Ok(OutboxStatus::Failed);
            }
        };

        let payload = serde_json::to_vec(&message)?;

        match self
            .broker
            .publish(Topic::Main, &message.partition_key, &payload)
            .await
        {
            Ok(()) => {
                self.outbox.mark_published(intent.id).await?;
                debug!(intent_id = %intent.id, "Outbox row published");
                Ok(OutboxStatus::Published)
            }
            Err(e) => {
                let status = self
                    .outbox
                    .record_publish_failure(
                        intent.id,
                        &e.to_string(),
                        self.config.max_publish_attempts,
                    )
                    .await?;

                if status == OutboxStatus::Failed {
                    error!(
                        intent_id = %intent.id,
                        attempts = intent.publish_attempts + 1,
                        error = %e,
                        "Outbox row exhausted its publish attempts, marked failed"
                    );
                } else {
                    warn!(
                        intent_id = %intent.id,
                        attempts = intent.publish_attempts + 1,
                        error = %e,
                        "Publish failed, row stays pending"
                    );
                }

                Ok(status)
            }
        }
    }

    pub async fn retry_failed(&self, limit: i64) -> Result<u64, Error> {
        let reset = self.outbox.retry_failed(limit).await?;
        info!(reset, "Failed outbox rows reset to pending");
        Ok(reset)
    }

    pub async fn prune_published(&self, older_than: Duration) -> Result<u64, Error> {
        let cutoff = Utc::now() - TimeDelta::from_std(older_than)?;
        let pruned = self.outbox.prune_published(cutoff).await?;
        info!(pruned, cutoff = %cutoff, "Published outbox rows pruned");
        Ok(pruned)
    }

    pub async fn stats(&self) -> Result<OutboxStats, Error> {
        self.outbox.stats().await
    }
}
