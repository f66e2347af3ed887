use std::fmt::{Display, Formatter, Result as FmtResult};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Main,
    Retry,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Main => "main",
            Topic::Retry => "retry",
        }
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Stable partition for a key: the first eight bytes of its SHA-256 digest,
/// big-endian, modulo the partition count.
pub fn partition_for(partition_key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(partition_key.as_bytes());

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);

    let partitions = u64::from(partitions.max(1));
    // The remainder is below `partitions`, which came from a u32.
    (u64::from_be_bytes(prefix) % partitions) as u32
}

pub fn queue_name(prefix: &str, topic: Topic, partition: u32) -> String {
    format!("{}.{}.{}", prefix, topic, partition)
}

pub fn dead_letter_queue_name(prefix: &str) -> String {
    format!("{}.dlq", prefix)
}

/// Publishing side of the partitioned log.
#[async_trait]
pub trait Broker: Send + Sync {
    fn partitions(&self) -> u32;

    /// Appends to `topic`, on the partition owning `partition_key`. Returns
    /// only after the broker has confirmed the write.
    async fn publish(&self, topic: Topic, partition_key: &str, payload: &[u8]) -> Result<()>;

    async fn publish_dead_letter(&self, payload: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DeadLetterDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
}

/// Operator access to the dead-letter queue. Fetched entries stay unacked
/// until acked or requeued, so one pass never sees the same entry twice.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn fetch(&self) -> Result<Option<DeadLetterDelivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn requeue(&self, delivery_tag: u64) -> Result<()>;

    async fn depth(&self) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
}

/// Ordered deliveries from one partition of one topic. A delivery stays
/// unacked, and blocks nothing but its own partition, until it is settled.
#[async_trait]
pub trait PartitionStream: Send {
    fn topic(&self) -> Topic;

    fn partition(&self) -> u32;

    /// Next delivery, or `None` once the stream is cancelled.
    async fn next(&mut self) -> Option<Result<InboundDelivery>>;

    async fn acknowledge(&self, delivery_tag: u64) -> Result<()>;

    async fn requeue(&self, delivery_tag: u64) -> Result<()>;

    async fn close(&self);
}

pub struct RabbitMqBroker {
    connection: Connection,
    publish_channel: Channel,
    dead_letter_channel: Channel,
    prefix: String,
    partitions: u32,
    prefetch_count: u16,
}

fn partitioned_queue_arguments() -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-single-active-consumer".into(),
        AMQPValue::Boolean(true),
    );
    arguments
}

impl RabbitMqBroker {
    pub async fn connect(
        rabbitmq_url: &str,
        prefix: &str,
        partitions: u32,
        prefetch_count: u16,
    ) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        let dead_letter_channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        let broker = Self {
            connection,
            publish_channel,
            dead_letter_channel,
            prefix: prefix.to_string(),
            partitions: partitions.max(1),
            prefetch_count,
        };

        broker.declare_queues().await?;

        info!(
            prefix = %broker.prefix,
            partitions = broker.partitions,
            "RabbitMQ connection established and queues declared"
        );

        Ok(broker)
    }

    async fn declare_queues(&self) -> Result<(), Error> {
        for topic in [Topic::Main, Topic::Retry] {
            for partition in 0..self.partitions {
                let name = queue_name(&self.prefix, topic, partition);

                self.publish_channel
                    .queue_declare(
                        &name,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        partitioned_queue_arguments(),
                    )
                    .await
                    .map_err(|e| anyhow!("Failed to declare queue {}: {}", name, e))?;
            }
        }

        let dlq = dead_letter_queue_name(&self.prefix);
        self.publish_channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare dead-letter queue: {}", e))?;

        Ok(())
    }

    async fn publish_to_queue(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let confirmation = self
            .publish_channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", queue, e))?
            .await
            .map_err(|e| anyhow!("Failed to await publisher confirm from {}: {}", queue, e))?;

        if confirmation.is_nack() {
            return Err(anyhow!("Broker rejected publish to {}", queue));
        }

        debug!(queue, bytes = payload.len(), "Message published");
        Ok(())
    }

    /// Subscribes to one partition of `topic` on its own channel. With single
    /// active consumer the broker delivers to at most one subscriber per
    /// partition across the worker group.
    pub async fn consume_partition(
        &self,
        topic: Topic,
        partition: u32,
        consumer_tag: &str,
    ) -> Result<PartitionConsumer, Error> {
        let queue = queue_name(&self.prefix, topic, partition);

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        let consumer = channel
            .basic_consume(
                &queue,
                &format!("{}-{}", consumer_tag, queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer for {}: {}", queue, e))?;

        debug!(queue = %queue, "Partition consumer created");

        Ok(PartitionConsumer {
            channel,
            consumer,
            topic,
            partition,
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            warn!(error = %e, "Failed to close RabbitMQ connection cleanly");
        }
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, topic: Topic, partition_key: &str, payload: &[u8]) -> Result<()> {
        let partition = partition_for(partition_key, self.partitions);
        let queue = queue_name(&self.prefix, topic, partition);
        self.publish_to_queue(&queue, payload).await
    }

    async fn publish_dead_letter(&self, payload: &[u8]) -> Result<()> {
        self.publish_to_queue(&dead_letter_queue_name(&self.prefix), payload)
            .await
    }
}

#[async_trait]
impl DeadLetterQueue for RabbitMqBroker {
    async fn fetch(&self) -> Result<Option<DeadLetterDelivery>> {
        let message = self
            .dead_letter_channel
            .basic_get(
                &dead_letter_queue_name(&self.prefix),
                BasicGetOptions { no_ack: false },
            )
            .await
            .map_err(|e| anyhow!("Failed to read dead-letter queue: {}", e))?;

        Ok(message.map(|m| DeadLetterDelivery {
            delivery_tag: m.delivery.delivery_tag,
            payload: m.delivery.data,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.dead_letter_channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge dead letter: {}", e))
    }

    async fn requeue(&self, delivery_tag: u64) -> Result<()> {
        self.dead_letter_channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|e| anyhow!("Failed to requeue dead letter: {}", e))
    }

    async fn depth(&self) -> Result<u64> {
        let queue = self
            .dead_letter_channel
            .queue_declare(
                &dead_letter_queue_name(&self.prefix),
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to inspect dead-letter queue: {}", e))?;

        Ok(u64::from(queue.message_count()))
    }
}

pub struct PartitionConsumer {
    channel: Channel,
    consumer: Consumer,
    topic: Topic,
    partition: u32,
}

#[async_trait]
impl PartitionStream for PartitionConsumer {
    fn topic(&self) -> Topic {
        self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Option<Result<InboundDelivery>> {
        self.consumer.next().await.map(|result| {
            result
                .map(|delivery| InboundDelivery {
                    delivery_tag: delivery.delivery_tag,
                    data: delivery.data,
                })
                .map_err(|e| anyhow!("Consumer error: {}", e))
        })
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    async fn requeue(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|e| anyhow!("Failed to requeue message: {}", e))?;

        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "shutdown").await {
            debug!(error = %e, "Partition channel already closed");
        }
    }
}
