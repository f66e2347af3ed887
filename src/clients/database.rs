use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
    types::Json,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::{
    audit::CreateAuditLog,
    intent::{NotificationIntent, OutboxStats},
    message::{Priority, Recipient},
    status::OutboxStatus,
    template::TemplateContext,
};

const INTENT_COLUMNS: &str = "id, notification_type, template, template_context, recipients, \
     backends, correlation_key, priority, status, publish_attempts, last_error, created_at, \
     published_at";

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, Error> {
    info!("Connecting to PostgreSQL database");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

    info!("PostgreSQL connection established");

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| anyhow!("Failed to apply migrations: {}", e))?;

    info!("Database migrations applied");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> Result<(), Error> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| anyhow!("Database health check failed: {}", e))?;

    Ok(())
}

/// Inserts an intent inside the caller's transaction. The row only becomes
/// visible to the relay if the caller commits, and it disappears with a
/// rollback.
pub async fn write_intent(
    tx: &mut Transaction<'_, Postgres>,
    intent: &NotificationIntent,
) -> Result<Uuid, sqlx::Error> {
    insert_intent_query(intent).execute(&mut **tx).await?;

    debug!(
        intent_id = %intent.id,
        notification_type = %intent.notification_type,
        "Notification intent written to outbox"
    );

    Ok(intent.id)
}

fn insert_intent_query(
    intent: &NotificationIntent,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO notification_outbox (
            id,
            notification_type,
            template,
            template_context,
            recipients,
            backends,
            correlation_key,
            priority,
            status,
            publish_attempts,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(intent.id)
    .bind(intent.notification_type.as_str())
    .bind(&intent.template)
    .bind(Json(&intent.template_context))
    .bind(Json(&intent.recipients))
    .bind(&intent.backends)
    .bind(&intent.correlation_key)
    .bind(intent.priority.as_i16())
    .bind(intent.status.to_string())
    .bind(intent.publish_attempts)
    .bind(intent.created_at)
}

fn intent_from_row(row: &PgRow) -> Result<NotificationIntent, Error> {
    let notification_type: String = row.try_get("notification_type")?;
    let status: String = row.try_get("status")?;
    let Json(template_context): Json<TemplateContext> = row.try_get("template_context")?;
    let Json(recipients): Json<Vec<Recipient>> = row.try_get("recipients")?;

    Ok(NotificationIntent {
        id: row.try_get("id")?,
        notification_type: notification_type.parse()?,
        template: row.try_get("template")?,
        template_context,
        recipients,
        backends: row.try_get("backends")?,
        correlation_key: row.try_get("correlation_key")?,
        priority: Priority::from_i16(row.try_get("priority")?),
        status: status.parse()?,
        publish_attempts: row.try_get("publish_attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
    })
}

pub async fn insert_audit_entry(pool: &PgPool, log: &CreateAuditLog) -> Result<(), Error> {
    sqlx::query(
        r#"
        INSERT INTO notification_audit_log (
            message_id,
            notification_type,
            template,
            correlation_key,
            recipient_count,
            backends,
            retry_count,
            metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(log.message_id)
    .bind(log.notification_type.as_str())
    .bind(&log.template)
    .bind(&log.correlation_key)
    .bind(log.recipient_count)
    .bind(&log.backends)
    .bind(log.retry_count)
    .bind(&log.metadata)
    .execute(pool)
    .await
    .map_err(|e| {
        error!(
            error = %e,
            message_id = %log.message_id,
            "Failed to write audit log to database"
        );
        anyhow!("Database write failed: {}", e)
    })?;

    debug!(message_id = %log.message_id, "Audit log written to database");

    Ok(())
}

/// Storage side of the outbox as seen by the relay and the producer.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, intent: &NotificationIntent) -> Result<Uuid>;

    /// Leases up to `limit` pending rows, oldest first. Rows leased by another
    /// relay and not yet expired are skipped.
    async fn claim_pending(&self, limit: i64, lease: Duration) -> Result<Vec<NotificationIntent>>;

    async fn mark_published(&self, id: Uuid) -> Result<()>;

    /// Drops the lease on rows that were claimed but not attempted.
    async fn release_claims(&self, ids: &[Uuid]) -> Result<()>;

    /// Counts a failed publish. Returns the row's status afterwards, `Failed`
    /// once `max_attempts` is reached.
    async fn record_publish_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> Result<OutboxStatus>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Moves up to `limit` failed rows back to pending with a fresh attempt count.
    async fn retry_failed(&self, limit: i64) -> Result<u64>;

    async fn prune_published(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self) -> Result<OutboxStats>;
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, intent: &NotificationIntent) -> Result<Uuid> {
        insert_intent_query(intent)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to insert outbox row: {}", e))?;

        Ok(intent.id)
    }

    async fn claim_pending(&self, limit: i64, lease: Duration) -> Result<Vec<NotificationIntent>> {
        let query = format!(
            r#"
            UPDATE notification_outbox
            SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id FROM notification_outbox
                WHERE status = 'pending'
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            INTENT_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(limit)
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to claim pending outbox rows: {}", e))?;

        let mut intents = rows
            .iter()
            .map(intent_from_row)
            .collect::<Result<Vec<_>>>()?;

        // RETURNING does not preserve the subquery's order.
        intents.sort_by_key(|intent| intent.created_at);

        Ok(intents)
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = 'published', published_at = NOW(), claimed_until = NULL,
                last_error = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to mark outbox row published: {}", e))?;

        Ok(())
    }

    async fn release_claims(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE notification_outbox SET claimed_until = NULL WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to release outbox leases: {}", e))?;

        Ok(())
    }

    async fn record_publish_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> Result<OutboxStatus> {
        let row = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET publish_attempts = publish_attempts + 1,
                last_error = $2,
                claimed_until = NULL,
                status = CASE WHEN publish_attempts + 1 >= $3 THEN 'failed' ELSE status END
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to record publish failure: {}", e))?;

        let status: String = row.try_get("status")?;
        status.parse()
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = 'failed', last_error = $2, claimed_until = NULL,
                publish_attempts = publish_attempts + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to mark outbox row failed: {}", e))?;

        Ok(())
    }

    async fn retry_failed(&self, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = 'pending', publish_attempts = 0, claimed_until = NULL
            WHERE id IN (
                SELECT id FROM notification_outbox
                WHERE status = 'failed'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to reset failed outbox rows: {}", e))?;

        Ok(result.rows_affected())
    }

    async fn prune_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM notification_outbox WHERE status = 'published' AND published_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to prune published outbox rows: {}", e))?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'published') AS published,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM notification_outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to read outbox stats: {}", e))?;

        Ok(OutboxStats {
            pending: row.try_get("pending")?,
            published: row.try_get("published")?,
            failed: row.try_get("failed")?,
        })
    }
}
