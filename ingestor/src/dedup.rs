use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::model::DedupKey;

pub const DEDUP_TTL: Duration = Duration::from_secs(60);

/// Atomic check-and-claim over a `(device, second)` window.
///
/// `claim` returns `Ok(true)` exactly once per key until the claim expires;
/// concurrent callers for the same key get `Ok(false)`. Any failure to reach
/// the backing store is `Error::DedupUnavailable`.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    async fn claim(&self, key: &DedupKey, ttl: Duration) -> Result<bool>;
}

/// Claims keys with `SET key 1 EX ttl NX`.
pub struct RedisDeduplicator {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisDeduplicator {
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        info!("Connecting to Redis...");
        let client =
            redis::Client::open(redis_url).map_err(|e| Error::DedupUnavailable(e.to_string()))?;
        let conn = timeout(op_timeout.max(Duration::from_secs(1)), ConnectionManager::new(client))
            .await
            .map_err(|_| Error::DedupUnavailable("timed out connecting to Redis".to_string()))?
            .map_err(|e| Error::DedupUnavailable(e.to_string()))?;
        info!("Redis connection established");

        Ok(Self {
            conn,
            timeout: op_timeout,
        })
    }
}

#[async_trait]
impl Deduplicator for RedisDeduplicator {
    async fn claim(&self, key: &DedupKey, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key.as_str())
            .arg(1)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .arg("NX");

        let result: RedisResult<Option<String>> = timeout(self.timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::DedupUnavailable(format!("SET NX timed out for {}", key)))?;

        match result {
            Ok(Some(_)) => Ok(true),
            Ok(None) => {
                debug!(key = %key, "Key already claimed");
                Ok(false)
            }
            Err(e) => Err(Error::DedupUnavailable(e.to_string())),
        }
    }
}

/// Process-local claims with expiry on the tokio clock.
#[derive(Debug, Default)]
pub struct InMemoryDeduplicator {
    claims: Mutex<HashMap<DedupKey, Instant>>,
}

impl InMemoryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Deduplicator for InMemoryDeduplicator {
    async fn claim(&self, key: &DedupKey, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| Error::DedupUnavailable("claim table poisoned".to_string()))?;

        claims.retain(|_, expires_at| *expires_at > now);
        if claims.contains_key(key) {
            return Ok(false);
        }
        claims.insert(key.clone(), now + ttl);
        Ok(true)
    }
}
