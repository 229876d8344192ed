use crate::errors::GatewayError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Count and remaining window for one rate-limit key.
#[derive(Debug, Clone, Copy)]
pub struct WindowCount {
    pub count: u64,
    /// Remaining TTL in seconds; negative when the store reports none.
    pub ttl_secs: i64,
}

/// Narrow view of the shared key/value store. Config caching and rate
/// counters are the only consumers; everything else stays in-process.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), GatewayError>;
    async fn del(&self, key: &str) -> Result<(), GatewayError>;
    /// INCR then TTL, pipelined; a fresh key gets EXPIRE window_secs.
    /// Atomicity against expiry races is relaxed by design.
    async fn incr_with_window(
        &self,
        key: &str,
        window_secs: u64,
    ) -> Result<WindowCount, GatewayError>;
}

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url).map_err(|err| GatewayError::Kv(err.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|err| GatewayError::Kv(err.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| GatewayError::Kv(err.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| GatewayError::Kv(err.to_string()))
    }

    async fn del(&self, key: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| GatewayError::Kv(err.to_string()))
    }

    async fn incr_with_window(
        &self,
        key: &str,
        window_secs: u64,
    ) -> Result<WindowCount, GatewayError> {
        let mut conn = self.conn.clone();
        let (count, ttl_secs): (u64, i64) = redis::pipe()
            .cmd("INCR")
            .arg(key)
            .cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| GatewayError::Kv(err.to_string()))?;

        if ttl_secs < 0 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|err| GatewayError::Kv(err.to_string()))?;
            return Ok(WindowCount {
                count,
                ttl_secs: window_secs as i64,
            });
        }

        Ok(WindowCount { count, ttl_secs })
    }
}

/// Process-local stand-in used when no Redis endpoint is configured and by
/// the test harness. Single-replica semantics only.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, (String, Option<Instant>)>,
    counters: DashMap<String, (u64, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        if let Some(entry) = self.values.get(key) {
            let (value, deadline) = entry.value();
            if deadline.map(|d| Instant::now() < d).unwrap_or(true) {
                return Ok(Some(value.clone()));
            }
        }
        self.values.remove(key);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), GatewayError> {
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        self.values
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), GatewayError> {
        self.values.remove(key);
        Ok(())
    }

    async fn incr_with_window(
        &self,
        key: &str,
        window_secs: u64,
    ) -> Result<WindowCount, GatewayError> {
        let now = Instant::now();
        let window = Duration::from_secs(window_secs);
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| (0, now + window));
        let (count, deadline) = entry.value_mut();
        if now >= *deadline {
            *count = 0;
            *deadline = now + window;
        }
        *count += 1;
        let ttl_secs = deadline.saturating_duration_since(now).as_secs() as i64;
        Ok(WindowCount {
            count: *count,
            ttl_secs,
        })
    }
}
