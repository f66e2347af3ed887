use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    models::{retry::RetryConfig, status::DedupClaim},
    utils::retry_with_backoff,
};

/// Content-keyed claim store. The value stored under a key is the id of the
/// message that holds it, which is what separates a broker redelivery from a
/// second message with the same content.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn claim(&self, dedup_key: &str, message_id: Uuid, ttl: Duration) -> Result<DedupClaim>;

    /// Deletes the claim only while `message_id` still holds it. Returns
    /// whether a claim was removed.
    async fn release(&self, dedup_key: &str, message_id: Uuid) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

pub struct RedisDedupStore {
    connection: MultiplexedConnection,
    retry_config: RetryConfig,
}

/// Compare-and-delete on the holder id.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn storage_key(dedup_key: &str) -> String {
    format!("notification:dedup:{}", dedup_key)
}

impl RedisDedupStore {
    pub async fn connect(redis_url: &str, retry_config: RetryConfig) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            retry_config,
        })
    }

    async fn set_if_absent(&self, key: &str, message_id: Uuid, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.connection.clone();

        // Some("OK") when the key was set, None when it already existed.
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(message_id.to_string())
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to claim dedup key: {}", e))?;

        Ok(result.is_some())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();

        conn.get(key)
            .await
            .map_err(|e| anyhow!("Failed to read dedup key: {}", e))
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn claim(&self, dedup_key: &str, message_id: Uuid, ttl: Duration) -> Result<DedupClaim> {
        let key = storage_key(dedup_key);
        let ttl_secs = ttl.as_secs().max(1);

        // A key can expire between the failed SET and the GET; one more round
        // settles it.
        for _ in 0..2 {
            if self.set_if_absent(&key, message_id, ttl_secs).await? {
                return Ok(DedupClaim::Claimed);
            }

            match self.holder(&key).await? {
                Some(holder) if holder == message_id.to_string() => {
                    debug!(%message_id, "Dedup key already held by this message");
                    return Ok(DedupClaim::Redelivery);
                }
                Some(_) => return Ok(DedupClaim::Duplicate),
                None => continue,
            }
        }

        Err(anyhow!("Dedup key '{}' kept changing while claiming", dedup_key))
    }

    async fn release(&self, dedup_key: &str, message_id: Uuid) -> Result<bool> {
        let key = storage_key(dedup_key);
        let holder = message_id.to_string();
        let script = Script::new(RELEASE_SCRIPT);

        let removed: i64 = retry_with_backoff(&self.retry_config, || {
            let mut conn = self.connection.clone();
            let mut invocation = script.prepare_invoke();
            invocation.key(&key).arg(&holder);

            async move {
                invocation
                    .invoke_async::<i64>(&mut conn)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to release dedup key: {}", e))?;

        if removed == 0 {
            debug!(%message_id, "Dedup key no longer held by this message, left in place");
        }

        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();

        conn.ping::<String>()
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;

        Ok(())
    }
}
