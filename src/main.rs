use std::sync::Arc;

use anyhow::{Error, Result};
use dispatch_service::{
    api::run_api_server,
    backends::build_handlers,
    clients::{
        database::{self, OutboxStore, PgOutboxStore},
        health::HealthChecker,
        rbmq::RabbitMqBroker,
        redis::{DedupStore, RedisDedupStore},
    },
    config::Config,
    crypto::PayloadCipher,
    dlq::DeadLetterPublisher,
    producer::MessageBuilder,
    relay::{Relay, RelayConfig},
    template::TemplateEngine,
    utils::{cancel_on_shutdown_signal, init_tracing},
    worker::{Worker, WorkerConfig},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing("dispatch_service=info,dispatch_worker=info")?;

    let config = Config::load()?;
    info!(config = ?config, "Configuration loaded");

    let pool = database::connect(&config.database_url, config.database_max_connections).await?;
    database::run_migrations(&pool).await?;

    let cipher = PayloadCipher::from_base64(&config.payload_encryption_key)?;
    let templates = Arc::new(TemplateEngine::with_builtin_templates());
    let builder = MessageBuilder::new(cipher, templates);

    let dedup: Arc<dyn DedupStore> =
        Arc::new(RedisDedupStore::connect(&config.redis_url, config.retry_config()).await?);

    let broker = Arc::new(
        RabbitMqBroker::connect(
            &config.rabbitmq_url,
            &config.broker_topic_prefix,
            config.broker_partitions,
            config.prefetch_count,
        )
        .await?,
    );

    let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
    let handlers = build_handlers(&config, Some(pool.clone()))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let relay = Relay::new(
        outbox.clone(),
        broker.clone(),
        builder.clone(),
        RelayConfig::from_config(&config),
    );

    let dead_letters =
        DeadLetterPublisher::new(broker.clone(), dedup.clone(), config.retry_config());

    let worker = Arc::new(Worker::new(
        WorkerConfig::from_config(&config),
        builder,
        dedup.clone(),
        broker.clone(),
        dead_letters,
        handlers,
    ));

    let health_checker = HealthChecker::new(
        Some(pool.clone()),
        dedup,
        broker.clone(),
        outbox,
        config.dlq_alert_threshold,
    );

    let relay_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { relay.run(cancel).await }
    });

    let api_task = tokio::spawn(run_api_server(
        config.server_port,
        health_checker,
        cancel.clone(),
    ));

    let worker_result = worker.run(&broker, cancel.clone()).await;
    cancel.cancel();

    match relay_task.await {
        Ok(Err(e)) => error!(error = %e, "Outbox relay exited with error"),
        Err(e) => error!(error = %e, "Outbox relay task panicked"),
        Ok(Ok(())) => {}
    }

    match api_task.await {
        Ok(Err(e)) => error!(error = %e, "Health server exited with error"),
        Err(e) => error!(error = %e, "Health server task panicked"),
        Ok(Ok(())) => {}
    }

    broker.close().await;
    pool.close().await;

    if let Err(e) = &worker_result {
        error!(error = %e, "Delivery worker exited with error");
    }

    info!("Dispatch service stopped");
    worker_result
}
