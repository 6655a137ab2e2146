//! Redis-backed shared counters.
//!
//! Each increment is a single scripted round-trip: `INCR`, set the window
//! expiry if the key is new (or lost its TTL), and read the remaining TTL.
//! Concurrent requests for the same key are therefore linearized by Redis.
//!
//! The store may start without a connection. Request-path calls never dial
//! Redis; only [`SharedCounters::ping`] (driven by the health check)
//! establishes or re-establishes the connection.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CounterSnapshot, SharedCounters, StoreError};
use crate::config::StoreConfig;
use crate::ratelimit::CounterKey;

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Fixed-window counters stored in Redis.
pub struct RedisCounterStore {
    client: Client,
    connection: RwLock<Option<ConnectionManager>>,
    key_prefix: String,
    connect_timeout: Duration,
    script: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.connection.read().is_some())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create a store for `url` without connecting.
    ///
    /// # Errors
    /// Returns an error if the URL is malformed.
    pub fn new(url: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            key_prefix: config.key_prefix.clone(),
            connect_timeout: config.connect_timeout(),
            script: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Create a store and make one connection attempt. A failed attempt is
    /// logged, not returned; the health check retries later.
    pub async fn connect(url: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(url, config)?;
        match store.reconnect().await {
            Ok(_) => info!(prefix = %store.key_prefix, "Connected to Redis counter store"),
            Err(e) => warn!(error = %e, "Redis unavailable at startup, starting in fallback mode"),
        }
        Ok(store)
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Get the Redis key for a counter.
    fn key(&self, key: &CounterKey) -> String {
        format!("{}{}", self.key_prefix, key.to_store_key())
    }

    fn current(&self) -> Result<ConnectionManager, StoreError> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))
    }

    async fn reconnect(&self) -> Result<ConnectionManager, StoreError> {
        let manager = tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.connect_timeout))??;

        *self.connection.write() = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl SharedCounters for RedisCounterStore {
    fn provider(&self) -> &'static str {
        "redis"
    }

    async fn increment(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.current()?;
        let redis_key = self.key(key);
        let window_ms = window.as_millis().max(1) as u64;

        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(&redis_key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %redis_key, count, ttl_ms, "Incremented shared counter");

        Ok(CounterSnapshot {
            count,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = match self.current() {
            Ok(conn) => conn,
            Err(_) => self.reconnect().await?,
        };

        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
