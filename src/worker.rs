use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use chrono::Utc;
use futures_util::future::join_all;
use tokio::{
    sync::Semaphore,
    time::{Instant, sleep, timeout_at},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    backends::{BackendHandler, Delivery, find_handler},
    clients::{
        rbmq::{Broker, PartitionStream, RabbitMqBroker, Topic},
        redis::DedupStore,
    },
    config::Config,
    dlq::DeadLetterPublisher,
    error::{BackendError, DispatchError},
    models::{
        message::NotificationMessage,
        outcome::{BackendOutcome, DeliveryResult},
        retry::{RetryConfig, RetryDecision, RetryPolicy, compute_next_retry},
        status::{DedupClaim, ProcessingState},
    },
    producer::MessageBuilder,
    utils::retry_with_backoff,
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub dedup_ttl: Duration,
    pub message_timeout: Duration,
    pub max_in_flight: usize,
    pub shutdown_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub infra_retry: RetryConfig,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            dedup_ttl: config.dedup_ttl(),
            message_timeout: config.message_timeout(),
            max_in_flight: config.worker_max_in_flight.max(1),
            shutdown_timeout: config.shutdown_timeout(),
            retry_policy: config.retry_policy(),
            infra_retry: config.retry_config(),
        }
    }
}

/// What to tell the broker about a delivery once the worker is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully handled: delivered, skipped as a duplicate, re-published for
    /// retry or dead-lettered.
    Ack,
    /// Not handled; the broker should deliver it again.
    Requeue,
}

pub struct Worker {
    dedup: Arc<dyn DedupStore>,
    broker: Arc<dyn Broker>,
    dead_letters: DeadLetterPublisher,
    builder: MessageBuilder,
    handlers: Vec<Arc<dyn BackendHandler>>,
    in_flight: Arc<Semaphore>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        builder: MessageBuilder,
        dedup: Arc<dyn DedupStore>,
        broker: Arc<dyn Broker>,
        dead_letters: DeadLetterPublisher,
        handlers: Vec<Arc<dyn BackendHandler>>,
    ) -> Self {
        Self {
            dedup,
            broker,
            dead_letters,
            builder,
            handlers,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
        }
    }

    /// Consumes every main and retry partition until `cancel` fires, then
    /// waits up to the shutdown timeout for in-flight messages.
    pub async fn run(
        self: Arc<Self>,
        broker: &RabbitMqBroker,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let mut streams: Vec<Box<dyn PartitionStream>> = Vec::new();

        for topic in [Topic::Main, Topic::Retry] {
            for partition in 0..broker.partitions() {
                let consumer = broker
                    .consume_partition(topic, partition, &self.config.worker_id)
                    .await?;
                streams.push(Box::new(consumer));
            }
        }

        self.run_streams(streams, cancel).await;
        Ok(())
    }

    /// Runs one task per stream. After `cancel` fires, tasks get the shutdown
    /// timeout to finish; deliveries still in flight after that are left
    /// unacked for the broker to redeliver.
    pub async fn run_streams(
        self: Arc<Self>,
        streams: Vec<Box<dyn PartitionStream>>,
        cancel: CancellationToken,
    ) {
        let tracker = TaskTracker::new();
        let abandon = CancellationToken::new();
        let stream_count = streams.len();

        for stream in streams {
            let worker = self.clone();
            let cancel = cancel.clone();
            let abandon = abandon.clone();
            tracker.spawn(async move { worker.run_partition(stream, cancel, abandon).await });
        }
        tracker.close();

        info!(
            worker_id = %self.config.worker_id,
            streams = stream_count,
            max_in_flight = self.config.max_in_flight,
            "Delivery worker started"
        );

        cancel.cancelled().await;
        info!("Worker draining in-flight messages");

        if tokio::time::timeout(self.config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            abandon.cancel();
            warn!(
                shutdown_timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown deadline reached with messages in flight; the broker will redeliver them"
            );
        }

        info!("Delivery worker stopped");
    }

    /// Messages of one partition are handled strictly one after another.
    async fn run_partition(
        &self,
        mut stream: Box<dyn PartitionStream>,
        cancel: CancellationToken,
        abandon: CancellationToken,
    ) {
        let topic = stream.topic();
        let partition = stream.partition();

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(%topic, partition, error = %e, "Partition consumer failed, shutting worker down");
                        cancel.cancel();
                        break;
                    }
                    None => {
                        warn!(%topic, partition, "Partition consumer closed");
                        break;
                    }
                },
            };

            let disposition = self
                .settle_in_place(topic, partition, &delivery.data, &cancel)
                .await;

            if abandon.is_cancelled() {
                debug!(%topic, partition, "Past the shutdown deadline, leaving delivery unacked");
                return;
            }

            let result = match disposition {
                Disposition::Ack => stream.acknowledge(delivery.delivery_tag).await,
                Disposition::Requeue => stream.requeue(delivery.delivery_tag).await,
            };

            if let Err(e) = result {
                warn!(%topic, partition, error = %e, "Failed to settle delivery");
            }
        }

        stream.close().await;
        debug!(%topic, partition, "Partition consumer stopped");
    }

    /// Handles one delivery until it can be acked. Prefetched deliveries wait
    /// behind it, so it is only handed back to the broker on shutdown.
    async fn settle_in_place(
        &self,
        topic: Topic,
        partition: u32,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Disposition {
        let retry = &self.config.infra_retry;
        let mut delay_ms = retry.initial_delay_ms.max(1);
        let mut attempt = 1u32;

        loop {
            if self.handle_payload(topic, payload, cancel).await == Disposition::Ack {
                return Disposition::Ack;
            }

            if cancel.is_cancelled() {
                return Disposition::Requeue;
            }

            warn!(%topic, partition, attempt, delay_ms, "Delivery not settled, retrying in place");

            tokio::select! {
                _ = cancel.cancelled() => return Disposition::Requeue,
                _ = sleep(Duration::from_millis(delay_ms)) => {}
            }

            attempt = attempt.saturating_add(1);
            delay_ms = delay_ms
                .saturating_mul(retry.backoff_multiplier.max(2))
                .min(retry.max_delay_ms.max(1));
        }
    }

    /// Decodes a raw delivery, waits until it is due if it is a scheduled
    /// retry, then processes it under the in-flight limit.
    pub async fn handle_payload(
        &self,
        topic: Topic,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Disposition {
        let message = match serde_json::from_slice::<NotificationMessage>(payload) {
            Ok(message) => message,
            Err(e) => {
                let reason = DispatchError::Malformed(e.to_string()).to_string();
                return match self.dead_letters.quarantine(payload, &reason).await {
                    Ok(()) => Disposition::Ack,
                    Err(e) => {
                        error!(%topic, error = %e, "Failed to quarantine undecodable payload");
                        Disposition::Requeue
                    }
                };
            }
        };

        if !self.wait_until_due(&message, cancel).await {
            debug!(message_id = %message.id, "Shutdown while holding a scheduled retry");
            return Disposition::Requeue;
        }

        let Ok(_permit) = self.in_flight.acquire().await else {
            return Disposition::Requeue;
        };

        self.process(message).await
    }

    /// Sleeps until `next_retry_at`. Returns false if cancelled first.
    async fn wait_until_due(&self, message: &NotificationMessage, cancel: &CancellationToken) -> bool {
        let Some(due) = message.next_retry_at else {
            return true;
        };

        let Ok(wait) = (due - Utc::now()).to_std() else {
            return true;
        };

        debug!(
            message_id = %message.id,
            retry_count = message.retry_count,
            wait_secs = wait.as_secs(),
            "Holding retry until it is due"
        );

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    pub async fn process(&self, message: NotificationMessage) -> Disposition {
        let deadline = Instant::now() + self.config.message_timeout;

        debug!(
            message_id = %message.id,
            retry_count = message.retry_count,
            state = %ProcessingState::Received,
            "Message received"
        );

        // The first attempt holds the claim; retries carry it forward.
        if !message.is_retry() {
            debug!(message_id = %message.id, state = %ProcessingState::Deduplicating, "Claiming dedup key");

            match self.claim(&message).await {
                Ok(DedupClaim::Claimed) => {}
                Ok(DedupClaim::Redelivery) => {
                    info!(message_id = %message.id, "Broker redelivery, processing again");
                }
                Ok(DedupClaim::Duplicate) => {
                    // The dedup key is bound into the envelope, so a rewritten
                    // key cannot pass as a duplicate.
                    if let Err(e) = self.builder.verify(&message) {
                        let failed = message.backends.clone();
                        return self.dead_letter(message, DispatchError::from(e), failed).await;
                    }

                    info!(
                        message_id = %message.id,
                        state = %ProcessingState::DuplicateSkipped,
                        "Duplicate notification content, skipping"
                    );
                    return Disposition::Ack;
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Dedup store unavailable, requeueing");
                    return Disposition::Requeue;
                }
            }
        }

        let payload = match self.builder.open(&message) {
            Ok(payload) => payload,
            Err(e) => {
                let failed = message.backends.clone();
                return self.dead_letter(message, DispatchError::from(e), failed).await;
            }
        };
        debug!(message_id = %message.id, state = %ProcessingState::Decrypted, "Payload decrypted");

        let rendered = match self
            .builder
            .templates()
            .render(&payload.template, &payload.template_context)
        {
            Ok(rendered) => rendered,
            Err(e) => {
                let failed = message.backends.clone();
                return self.dead_letter(message, DispatchError::from(e), failed).await;
            }
        };

        let delivery = Delivery {
            message,
            payload,
            rendered,
        };

        let result = self.dispatch(&delivery, deadline).await;
        let state = result.state();
        info!(
            message_id = %delivery.message.id,
            state = %state,
            failed_backends = ?result.failed_backends(),
            "Message dispatched"
        );

        self.settle(delivery.message, result).await
    }

    async fn claim(&self, message: &NotificationMessage) -> Result<DedupClaim, Error> {
        retry_with_backoff(&self.config.infra_retry, || {
            self.dedup
                .claim(&message.dedup_key, message.id, self.config.dedup_ttl)
        })
        .await
    }

    /// Invokes every requested backend concurrently, each bounded by the
    /// message deadline.
    async fn dispatch(&self, delivery: &Delivery, deadline: Instant) -> DeliveryResult {
        debug!(
            message_id = %delivery.message.id,
            state = %ProcessingState::Dispatching,
            backends = ?delivery.message.backends,
            "Dispatching to backends"
        );

        let calls = delivery.message.backends.iter().map(|backend| async move {
            let Some(handler) = find_handler(&self.handlers, backend) else {
                let err = BackendError::permanent(
                    backend.as_str(),
                    "lookup",
                    format!("no handler registered for backend '{}'", backend),
                );
                return BackendOutcome::failed(backend.as_str(), &err);
            };

            match timeout_at(deadline, handler.handle(delivery)).await {
                Ok(Ok(())) => BackendOutcome::succeeded(backend.as_str()),
                Ok(Err(err)) => {
                    warn!(
                        message_id = %delivery.message.id,
                        backend = %backend,
                        retryable = err.retryable,
                        error = %err,
                        "Backend delivery failed"
                    );
                    BackendOutcome::failed(backend.as_str(), &err)
                }
                Err(_) => {
                    let err = BackendError::retryable(
                        backend.as_str(),
                        "handle",
                        "message deadline exceeded",
                    );
                    warn!(message_id = %delivery.message.id, backend = %backend, "Backend timed out");
                    BackendOutcome::failed(backend.as_str(), &err)
                }
            }
        });

        DeliveryResult::new(delivery.message.id, join_all(calls).await)
    }

    async fn settle(&self, message: NotificationMessage, result: DeliveryResult) -> Disposition {
        if result.state() == ProcessingState::AllSucceeded {
            return Disposition::Ack;
        }

        let failed = result.failed_backends();
        let summary = result.error_summary();

        if result.has_permanent_failure() {
            return self
                .dead_letter(message, DispatchError::Permanent(summary), failed)
                .await;
        }

        match compute_next_retry(
            &message.retry_state(),
            &self.config.retry_policy,
            Utc::now(),
            &summary,
        ) {
            RetryDecision::Retry(state) => {
                let retry = message.for_retry(state, failed);
                self.publish_retry(retry).await
            }
            RetryDecision::Exhausted(state) => {
                let retry_count = state.retry_count;
                let exhausted = message.for_retry(state, failed.clone());
                self.dead_letter(
                    exhausted,
                    DispatchError::Exhausted {
                        retry_count,
                        last_error: summary,
                    },
                    failed,
                )
                .await
            }
        }
    }

    async fn publish_retry(&self, retry: NotificationMessage) -> Disposition {
        let payload = match serde_json::to_vec(&retry) {
            Ok(payload) => payload,
            Err(e) => {
                error!(message_id = %retry.id, error = %e, "Failed to encode retry message");
                return Disposition::Requeue;
            }
        };

        match self
            .broker
            .publish(Topic::Retry, &retry.partition_key, &payload)
            .await
        {
            Ok(()) => {
                info!(
                    message_id = %retry.id,
                    retry_count = retry.retry_count,
                    next_retry_at = ?retry.next_retry_at,
                    backends = ?retry.backends,
                    "Retry scheduled"
                );
                Disposition::Ack
            }
            Err(e) => {
                warn!(message_id = %retry.id, error = %e, "Failed to publish retry, requeueing");
                Disposition::Requeue
            }
        }
    }

    async fn dead_letter(
        &self,
        message: NotificationMessage,
        reason: DispatchError,
        failed_backends: Vec<String>,
    ) -> Disposition {
        let message_id = message.id;

        match self
            .dead_letters
            .dead_letter(message, &reason.to_string(), failed_backends)
            .await
        {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                error!(%message_id, error = %e, "Dead-lettering failed, requeueing");
                Disposition::Requeue
            }
        }
    }
}
