use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::retry::{RetryConfig, RetryPolicy};

#[derive(Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    pub redis_url: String,
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,

    pub rabbitmq_url: String,
    #[serde(default = "default_broker_topic_prefix")]
    pub broker_topic_prefix: String,
    #[serde(default = "default_broker_partitions")]
    pub broker_partitions: u32,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Base64 encoded 32-byte AES-256-GCM key.
    pub payload_encryption_key: String,

    #[serde(default = "default_message_timeout_seconds")]
    pub message_timeout_seconds: u64,
    #[serde(default = "default_worker_max_in_flight")]
    pub worker_max_in_flight: usize,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    #[serde(default = "default_relay_poll_interval_secs")]
    pub relay_poll_interval_secs: u64,
    #[serde(default = "default_relay_batch_size")]
    pub relay_batch_size: i64,
    #[serde(default = "default_relay_claim_lease_secs")]
    pub relay_claim_lease_secs: u64,
    #[serde(default = "default_relay_max_publish_attempts")]
    pub relay_max_publish_attempts: i32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    #[serde(default = "default_infra_retry_attempts")]
    pub infra_retry_attempts: u32,
    #[serde(default = "default_infra_retry_initial_delay_ms")]
    pub infra_retry_initial_delay_ms: u64,
    #[serde(default = "default_infra_retry_max_delay_ms")]
    pub infra_retry_max_delay_ms: u64,

    #[serde(default = "default_dlq_alert_threshold")]
    pub dlq_alert_threshold: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    pub mail_api_url: Option<String>,
    pub mail_api_key: Option<String>,
    pub mail_from_address: Option<String>,
    pub mail_from_name: Option<String>,

    #[serde(default = "default_slack_api_url")]
    pub slack_api_url: String,
    pub slack_bot_token: Option<String>,
    pub discord_webhook_url: Option<String>,

    #[serde(default = "default_ntfy_server_url")]
    pub ntfy_server_url: String,
    pub ntfy_topic: Option<String>,
    pub ntfy_access_token: Option<String>,

    #[serde(default = "default_audit_enabled")]
    pub audit_enabled: bool,
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_dedup_ttl_seconds() -> u64 {
    86_400
}

fn default_broker_topic_prefix() -> String {
    "notifications".to_string()
}

fn default_broker_partitions() -> u32 {
    8
}

fn default_prefetch_count() -> u16 {
    16
}

fn default_message_timeout_seconds() -> u64 {
    30
}

fn default_worker_max_in_flight() -> usize {
    64
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

fn default_relay_poll_interval_secs() -> u64 {
    5
}

fn default_relay_batch_size() -> i64 {
    100
}

fn default_relay_claim_lease_secs() -> u64 {
    60
}

fn default_relay_max_publish_attempts() -> i32 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_secs() -> u64 {
    60
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_secs() -> u64 {
    7_200
}

fn default_infra_retry_attempts() -> u32 {
    3
}

fn default_infra_retry_initial_delay_ms() -> u64 {
    100
}

fn default_infra_retry_max_delay_ms() -> u64 {
    2_000
}

fn default_dlq_alert_threshold() -> u64 {
    100
}

fn default_server_port() -> u16 {
    8080
}

fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_ntfy_server_url() -> String {
    "https://ntfy.sh".to_string()
}

fn default_audit_enabled() -> bool {
    true
}

// Secrets stay out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("broker_topic_prefix", &self.broker_topic_prefix)
            .field("broker_partitions", &self.broker_partitions)
            .field("prefetch_count", &self.prefetch_count)
            .field("worker_id", &self.worker_id)
            .field("worker_max_in_flight", &self.worker_max_in_flight)
            .field("relay_batch_size", &self.relay_batch_size)
            .field("max_retries", &self.max_retries)
            .field("server_port", &self.server_port)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        if config.broker_partitions == 0 {
            return Err(anyhow!("BROKER_PARTITIONS must be at least 1"));
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
        }
    }

    /// Retry settings for infrastructure calls, not message deliveries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.infra_retry_attempts,
            initial_delay_ms: self.infra_retry_initial_delay_ms,
            max_delay_ms: self.infra_retry_max_delay_ms,
            backoff_multiplier: 2,
        }
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_seconds)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}
