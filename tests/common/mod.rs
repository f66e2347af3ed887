#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_service::{
    backends::{BackendHandler, Delivery},
    clients::{
        database::OutboxStore,
        rbmq::{
            Broker, DeadLetterDelivery, DeadLetterQueue, InboundDelivery, PartitionStream, Topic,
            partition_for,
        },
        redis::DedupStore,
    },
    crypto::PayloadCipher,
    dlq::DeadLetterPublisher,
    error::BackendError,
    models::{
        intent::{NotificationIntent, OutboxStats},
        message::{DeadLetterRecord, NotificationMessage, NotificationType, Recipient},
        retry::{RetryConfig, RetryPolicy},
        status::{DedupClaim, OutboxStatus},
        template::TemplateContext,
    },
    producer::MessageBuilder,
    template::TemplateEngine,
    worker::{Worker, WorkerConfig},
};
use serde_json::json;
use uuid::Uuid;

pub fn test_cipher() -> PayloadCipher {
    PayloadCipher::new(&[42u8; 32]).expect("valid test key")
}

pub fn templates() -> Arc<TemplateEngine> {
    Arc::new(TemplateEngine::with_builtin_templates())
}

pub fn message_builder() -> MessageBuilder {
    MessageBuilder::new(test_cipher(), templates())
}

pub fn fast_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2,
    }
}

pub fn approved_context(title: &str) -> TemplateContext {
    let mut ctx = TemplateContext::new();
    ctx.insert("approver_name".into(), json!("Ana"));
    ctx.insert("document_short_name".into(), json!("RFC-042"));
    ctx.insert("document_title".into(), json!(title));
    ctx.insert(
        "document_url".into(),
        json!("https://docs.example.com/rfc-042"),
    );
    ctx
}

pub fn approved_intent(backends: &[&str]) -> NotificationIntent {
    NotificationIntent::new(
        NotificationType::DocumentApproved,
        "document_approved",
        approved_context("Outbox relay"),
        vec![
            Recipient::new("owner@example.com")
                .with_display_name("Owner")
                .with_channel_id("slack", "U024BE7LH"),
        ],
        backends.iter().map(|b| b.to_string()).collect(),
    )
    .with_correlation_key("doc:42")
}

#[derive(Default)]
pub struct MemoryBroker {
    partitions: u32,
    published: Mutex<Vec<(Topic, u32, Vec<u8>)>>,
    dead_letters: Mutex<VecDeque<Vec<u8>>>,
    unacked: Mutex<HashMap<u64, Vec<u8>>>,
    next_tag: AtomicU64,
    failures_to_inject: AtomicU32,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            ..Default::default()
        }
    }

    /// The next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> bool {
        self.failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn published(&self, topic: Topic) -> Vec<(u32, NotificationMessage)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| *t == topic)
            .map(|(_, p, bytes)| (*p, serde_json::from_slice(bytes).unwrap()))
            .collect()
    }

    /// Removes and returns the oldest message published to `topic`.
    pub fn take_next(&self, topic: Topic) -> Option<NotificationMessage> {
        let mut published = self.published.lock().unwrap();
        let idx = published.iter().position(|(t, _, _)| *t == topic)?;
        let (_, _, bytes) = published.remove(idx);
        Some(serde_json::from_slice(&bytes).unwrap())
    }

    pub fn push_dead_letter_raw(&self, payload: Vec<u8>) {
        self.dead_letters.lock().unwrap().push_back(payload);
    }

    pub fn dead_letter_records(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters
            .lock()
            .unwrap()
            .iter()
            .filter_map(|bytes| serde_json::from_slice(bytes).ok())
            .collect()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().unwrap().len()
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().unwrap().len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, topic: Topic, partition_key: &str, payload: &[u8]) -> Result<()> {
        if self.injected_failure() {
            return Err(anyhow!("broker unavailable"));
        }

        let partition = partition_for(partition_key, self.partitions);
        self.published
            .lock()
            .unwrap()
            .push((topic, partition, payload.to_vec()));
        Ok(())
    }

    async fn publish_dead_letter(&self, payload: &[u8]) -> Result<()> {
        if self.injected_failure() {
            return Err(anyhow!("broker unavailable"));
        }

        self.dead_letters.lock().unwrap().push_back(payload.to_vec());
        Ok(())
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryBroker {
    async fn fetch(&self) -> Result<Option<DeadLetterDelivery>> {
        let Some(payload) = self.dead_letters.lock().unwrap().pop_front() else {
            return Ok(None);
        };

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.unacked.lock().unwrap().insert(tag, payload.clone());

        Ok(Some(DeadLetterDelivery {
            delivery_tag: tag,
            payload,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.unacked
            .lock()
            .unwrap()
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown delivery tag {}", delivery_tag))
    }

    async fn requeue(&self, delivery_tag: u64) -> Result<()> {
        let payload = self
            .unacked
            .lock()
            .unwrap()
            .remove(&delivery_tag)
            .ok_or_else(|| anyhow!("unknown delivery tag {}", delivery_tag))?;

        self.dead_letters.lock().unwrap().push_front(payload);
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        Ok(self.dead_letters.lock().unwrap().len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryDedupStore {
    entries: Mutex<HashMap<String, Uuid>>,
    unavailable: AtomicBool,
    claim_failures: AtomicU32,
}

impl MemoryDedupStore {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` claims fail.
    pub fn fail_next_claims(&self, count: u32) {
        self.claim_failures.store(count, Ordering::SeqCst);
    }

    pub fn holder(&self, dedup_key: &str) -> Option<Uuid> {
        self.entries.lock().unwrap().get(dedup_key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("dedup store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn claim(&self, dedup_key: &str, message_id: Uuid, _ttl: Duration) -> Result<DedupClaim> {
        self.check()?;
        if self
            .claim_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("dedup store timed out"));
        }

        let mut entries = self.entries.lock().unwrap();
        match entries.get(dedup_key) {
            None => {
                entries.insert(dedup_key.to_string(), message_id);
                Ok(DedupClaim::Claimed)
            }
            Some(holder) if *holder == message_id => Ok(DedupClaim::Redelivery),
            Some(_) => Ok(DedupClaim::Duplicate),
        }
    }

    async fn release(&self, dedup_key: &str, message_id: Uuid) -> Result<bool> {
        self.check()?;

        let mut entries = self.entries.lock().unwrap();
        if entries.get(dedup_key) == Some(&message_id) {
            entries.remove(dedup_key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[derive(Default)]
pub struct MemoryOutbox {
    rows: Mutex<Vec<NotificationIntent>>,
    leased: Mutex<HashSet<Uuid>>,
}

impl MemoryOutbox {
    pub fn row(&self, id: Uuid) -> Option<NotificationIntent> {
        self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }

    pub fn rows(&self) -> Vec<NotificationIntent> {
        self.rows.lock().unwrap().clone()
    }

    pub fn is_leased(&self, id: Uuid) -> bool {
        self.leased.lock().unwrap().contains(&id)
    }

    fn update<F: FnOnce(&mut NotificationIntent)>(&self, id: Uuid, f: F) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("no outbox row {}", id))?;
        f(row);
        self.leased.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn insert(&self, intent: &NotificationIntent) -> Result<Uuid> {
        self.rows.lock().unwrap().push(intent.clone());
        Ok(intent.id)
    }

    async fn claim_pending(&self, limit: i64, _lease: Duration) -> Result<Vec<NotificationIntent>> {
        let rows = self.rows.lock().unwrap();
        let mut leased = self.leased.lock().unwrap();

        let mut pending: Vec<NotificationIntent> = rows
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending && !leased.contains(&r.id))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));

        for row in &pending {
            leased.insert(row.id);
        }

        Ok(pending)
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        self.update(id, |row| {
            row.status = OutboxStatus::Published;
            row.published_at = Some(Utc::now());
            row.last_error = None;
        })
    }

    async fn release_claims(&self, ids: &[Uuid]) -> Result<()> {
        let mut leased = self.leased.lock().unwrap();
        for id in ids {
            leased.remove(id);
        }
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> Result<OutboxStatus> {
        let mut status = OutboxStatus::Pending;
        self.update(id, |row| {
            row.publish_attempts += 1;
            row.last_error = Some(error.to_string());
            if row.publish_attempts >= max_attempts {
                row.status = OutboxStatus::Failed;
            }
            status = row.status;
        })?;
        Ok(status)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.update(id, |row| {
            row.status = OutboxStatus::Failed;
            row.publish_attempts += 1;
            row.last_error = Some(error.to_string());
        })
    }

    async fn retry_failed(&self, limit: i64) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut reset = 0u64;

        for row in rows.iter_mut().filter(|r| r.status == OutboxStatus::Failed) {
            if reset >= u64::try_from(limit).unwrap_or(0) {
                break;
            }
            row.status = OutboxStatus::Pending;
            row.publish_attempts = 0;
            reset += 1;
        }

        Ok(reset)
    }

    async fn prune_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| {
            !(r.status == OutboxStatus::Published
                && r.published_at.is_some_and(|at| at < older_than))
        });
        Ok((before - rows.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows = self.rows.lock().unwrap();
        let count = |status: OutboxStatus| rows.iter().filter(|r| r.status == status).count() as i64;

        Ok(OutboxStats {
            pending: count(OutboxStatus::Pending),
            published: count(OutboxStatus::Published),
            failed: count(OutboxStatus::Failed),
        })
    }
}

/// Handler that replays a script of results, then repeats the fallback.
pub struct ScriptedHandler {
    name: String,
    script: Mutex<VecDeque<Result<(), BackendError>>>,
    fallback: Result<(), BackendError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<(Uuid, u32, String)>>,
}

impl ScriptedHandler {
    pub fn ok(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, Vec::new(), Ok(()), None))
    }

    pub fn failing(name: &str, retryable: bool, message: &str) -> Arc<Self> {
        let err = if retryable {
            BackendError::retryable(name, "send", message)
        } else {
            BackendError::permanent(name, "send", message)
        };
        Arc::new(Self::build(name, Vec::new(), Err(err), None))
    }

    pub fn scripted(name: &str, script: Vec<Result<(), BackendError>>) -> Arc<Self> {
        Arc::new(Self::build(name, script, Ok(()), None))
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name, Vec::new(), Ok(()), Some(delay)))
    }

    fn build(
        name: &str,
        script: Vec<Result<(), BackendError>>,
        fallback: Result<(), BackendError>,
        delay: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            fallback,
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most invocations that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen_ids(&self) -> Vec<Uuid> {
        self.seen().into_iter().map(|(id, _, _)| id).collect()
    }

    /// `(message id, retry count, rendered subject)` per invocation.
    pub fn seen(&self) -> Vec<(Uuid, u32, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendHandler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((
            delivery.message.id,
            delivery.message.retry_count,
            delivery.rendered.subject.clone(),
        ));

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked(u64),
    Requeued(u64),
}

/// One partition's deliveries, served in order. Once drained it waits like an
/// idle consumer.
pub struct MemoryPartition {
    topic: Topic,
    partition: u32,
    pending: VecDeque<InboundDelivery>,
    settlements: Arc<Mutex<Vec<Settlement>>>,
}

impl MemoryPartition {
    pub fn new(topic: Topic, partition: u32, payloads: Vec<Vec<u8>>) -> Self {
        let pending = payloads
            .into_iter()
            .enumerate()
            .map(|(i, data)| InboundDelivery {
                delivery_tag: i as u64 + 1,
                data,
            })
            .collect();

        Self {
            topic,
            partition,
            pending,
            settlements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn settlements(&self) -> Arc<Mutex<Vec<Settlement>>> {
        self.settlements.clone()
    }
}

#[async_trait]
impl PartitionStream for MemoryPartition {
    fn topic(&self) -> Topic {
        self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Option<Result<InboundDelivery>> {
        match self.pending.pop_front() {
            Some(delivery) => Some(Ok(delivery)),
            None => std::future::pending().await,
        }
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<()> {
        self.settlements
            .lock()
            .unwrap()
            .push(Settlement::Acked(delivery_tag));
        Ok(())
    }

    async fn requeue(&self, delivery_tag: u64) -> Result<()> {
        self.settlements
            .lock()
            .unwrap()
            .push(Settlement::Requeued(delivery_tag));
        Ok(())
    }

    async fn close(&self) {}
}

/// Polls `condition` until it holds or `limit` passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub struct Harness {
    pub worker: Arc<Worker>,
    pub broker: Arc<MemoryBroker>,
    pub dedup: Arc<MemoryDedupStore>,
    pub builder: MessageBuilder,
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        dedup_ttl: Duration::from_secs(86_400),
        message_timeout: Duration::from_secs(30),
        max_in_flight: 8,
        shutdown_timeout: Duration::from_secs(1),
        retry_policy: RetryPolicy::default(),
        infra_retry: fast_retry_config(),
    }
}

pub fn harness(handlers: Vec<Arc<dyn BackendHandler>>) -> Harness {
    harness_with_config(worker_config(), handlers)
}

pub fn harness_with_config(config: WorkerConfig, handlers: Vec<Arc<dyn BackendHandler>>) -> Harness {
    let broker = Arc::new(MemoryBroker::new(8));
    let dedup = Arc::new(MemoryDedupStore::default());
    let builder = message_builder();

    let dead_letters = DeadLetterPublisher::new(broker.clone(), dedup.clone(), fast_retry_config());

    let worker = Arc::new(Worker::new(
        config,
        builder.clone(),
        dedup.clone(),
        broker.clone(),
        dead_letters,
        handlers,
    ));

    Harness {
        worker,
        broker,
        dedup,
        builder,
    }
}
