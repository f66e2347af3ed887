use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::{
    clients::{
        database::{self, OutboxStore},
        rbmq::DeadLetterQueue,
        redis::DedupStore,
    },
    models::health::{HealthCheckResponse, HealthStatus, ServiceHealth},
};

const CRITICAL_CHECKS: [&str; 3] = ["database", "dedup_store", "message_broker"];

pub struct HealthChecker {
    pool: Option<PgPool>,
    dedup_store: Arc<dyn DedupStore>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    outbox: Arc<dyn OutboxStore>,
    dlq_alert_threshold: u64,
}

impl HealthChecker {
    pub fn new(
        pool: Option<PgPool>,
        dedup_store: Arc<dyn DedupStore>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        outbox: Arc<dyn OutboxStore>,
        dlq_alert_threshold: u64,
    ) -> Self {
        Self {
            pool,
            dedup_store,
            dead_letters,
            outbox,
            dlq_alert_threshold,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        if let Some(pool) = &self.pool {
            checks.insert("database".to_string(), Self::check_database(pool).await);
        }
        checks.insert("dedup_store".to_string(), self.check_dedup_store().await);

        let (broker_health, dlq_health) = self.check_broker_and_dlq().await;
        checks.insert("message_broker".to_string(), broker_health);
        if let Some(dlq_health) = dlq_health {
            checks.insert("dead_letter_queue".to_string(), dlq_health);
        }

        checks.insert("outbox".to_string(), self.check_outbox().await);

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_database(pool: &PgPool) -> ServiceHealth {
        let start = Instant::now();

        match database::health_check(pool).await {
            Ok(_) => {
                let elapsed = elapsed_ms(start);
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    async fn check_dedup_store(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.dedup_store.ping().await {
            Ok(_) => {
                let elapsed = elapsed_ms(start);
                debug!(response_time_ms = elapsed, "Dedup store health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Dedup store ping failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    /// Reading the DLQ depth doubles as the broker liveness check.
    async fn check_broker_and_dlq(&self) -> (ServiceHealth, Option<ServiceHealth>) {
        let start = Instant::now();

        match self.dead_letters.depth().await {
            Ok(depth) => {
                let broker = ServiceHealth::healthy(elapsed_ms(start));

                let dlq = if depth > self.dlq_alert_threshold {
                    warn!(
                        dlq_depth = depth,
                        threshold = self.dlq_alert_threshold,
                        "Dead-letter queue depth above alert threshold"
                    );
                    ServiceHealth::degraded(
                        depth,
                        format!("{} dead letters awaiting review", depth),
                    )
                } else {
                    ServiceHealth::healthy(0).with_depth(depth)
                };

                (broker, Some(dlq))
            }
            Err(e) => {
                warn!(error = %e, "Broker health check failed");
                (
                    ServiceHealth::unhealthy(format!("Queue inspection failed: {}", e)),
                    None,
                )
            }
        }
    }

    async fn check_outbox(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.outbox.stats().await {
            Ok(stats) => {
                let pending = u64::try_from(stats.pending).unwrap_or(0);
                let health = ServiceHealth::healthy(elapsed_ms(start)).with_depth(pending);

                if stats.failed > 0 {
                    ServiceHealth {
                        status: HealthStatus::Degraded,
                        error: Some(format!("{} outbox rows failed to publish", stats.failed)),
                        ..health
                    }
                } else {
                    health
                }
            }
            Err(e) => {
                warn!(error = %e, "Outbox stats query failed");
                ServiceHealth::unhealthy(format!("Stats query failed: {}", e))
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let critical_unhealthy = checks
        .iter()
        .filter(|(name, _)| CRITICAL_CHECKS.contains(&name.as_str()))
        .any(|(_, health)| health.status == HealthStatus::Unhealthy);

    let has_unhealthy = checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded);

    if critical_unhealthy {
        HealthStatus::Unhealthy
    } else if has_unhealthy || has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
