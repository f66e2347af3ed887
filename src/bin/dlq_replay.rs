//! Operator CLI for the dead-letter queue and the outbox.

use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use dispatch_service::{
    clients::{
        database::{self, OutboxStore, PgOutboxStore},
        rbmq::RabbitMqBroker,
        redis::{DedupStore, RedisDedupStore},
    },
    config::Config,
    crypto::PayloadCipher,
    dlq::{ReplayOptions, Replayer},
    producer::{MessageBuilder, Producer},
    relay::{Relay, RelayConfig},
    template::TemplateEngine,
    utils::init_tracing,
};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "dlq_replay")]
#[command(version, about = "Inspect and replay dead-lettered notifications", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print dead-letter entries without consuming them
    List {
        /// Maximum number of entries to print
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Re-inject dead letters as fresh notifications
    Replay(ReplayArgs),

    /// Outbox maintenance
    #[command(subcommand)]
    Outbox(OutboxCommands),
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false, id = "selection")]
struct ReplaySelection {
    /// Replay the entry with this message id
    #[arg(long)]
    id: Option<Uuid>,

    /// Replay every entry
    #[arg(long)]
    all: bool,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[command(flatten)]
    selection: ReplaySelection,

    /// Maximum number of entries to replay
    #[arg(long)]
    limit: Option<usize>,

    /// Decrypt and validate entries without publishing or consuming them
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum OutboxCommands {
    /// Show pending, published and failed row counts
    Stats,

    /// Move failed rows back to pending
    RetryFailed {
        #[arg(long, default_value = "100")]
        limit: i64,
    },

    /// Delete published rows older than the given number of days
    Prune {
        #[arg(long, default_value = "30")]
        older_than_days: u64,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing("dispatch_service=warn,dlq_replay=info")?;

    let cli = Cli::parse();
    let config = Config::load()?;

    let pool = database::connect(&config.database_url, 2).await?;
    let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));

    let cipher = PayloadCipher::from_base64(&config.payload_encryption_key)?;
    let templates = Arc::new(TemplateEngine::with_builtin_templates());
    let builder = MessageBuilder::new(cipher, templates.clone());

    let broker = Arc::new(
        RabbitMqBroker::connect(
            &config.rabbitmq_url,
            &config.broker_topic_prefix,
            config.broker_partitions,
            config.prefetch_count,
        )
        .await?,
    );

    let result = match cli.command {
        Commands::List { limit } => {
            let dedup = connect_dedup(&config).await?;
            let replayer = Replayer::new(
                broker.clone(),
                dedup,
                builder,
                Producer::new(outbox, templates),
            );
            print_json(&replayer.list(limit).await?)
        }
        Commands::Replay(args) => {
            let dedup = connect_dedup(&config).await?;
            let replayer = Replayer::new(
                broker.clone(),
                dedup,
                builder,
                Producer::new(outbox, templates),
            );

            let options = ReplayOptions {
                message_id: if args.selection.all {
                    None
                } else {
                    args.selection.id
                },
                limit: args.limit,
                dry_run: args.dry_run,
            };

            let report = replayer.replay(&options).await?;
            print_json(&report)?;

            match options.message_id {
                Some(id) if report.replayed.is_empty() && report.failed.is_empty() => {
                    Err(anyhow!("No dead letter with id {}", id))
                }
                _ if report.failed.is_empty() => Ok(()),
                _ => Err(anyhow!(
                    "{} entries could not be replayed",
                    report.failed.len()
                )),
            }
        }
        Commands::Outbox(command) => {
            let relay = Relay::new(
                outbox,
                broker.clone(),
                builder,
                RelayConfig::from_config(&config),
            );

            match command {
                OutboxCommands::Stats => print_json(&relay.stats().await?),
                OutboxCommands::RetryFailed { limit } => {
                    print_json(&serde_json::json!({ "reset": relay.retry_failed(limit).await? }))
                }
                OutboxCommands::Prune { older_than_days } => {
                    let older_than = Duration::from_secs(older_than_days.saturating_mul(86_400));
                    print_json(
                        &serde_json::json!({ "pruned": relay.prune_published(older_than).await? }),
                    )
                }
            }
        }
    };

    broker.close().await;
    pool.close().await;

    result
}

async fn connect_dedup(config: &Config) -> Result<Arc<dyn DedupStore>, Error> {
    Ok(Arc::new(
        RedisDedupStore::connect(&config.redis_url, config.retry_config()).await?,
    ))
}
