//! Redis-backed remote store.
//!
//! Counter state is stored as the JSON wire payload with `SET key value EX
//! ttl`, so every instance pointed at the same Redis shares quota. Each
//! operation is bounded by a timeout; a slow Redis is reported as
//! [`StoreError::Timeout`] and the tiered store falls back to local state.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use super::StateStore;
use crate::error::StoreError;
use crate::ratelimit::CounterState;

/// Remote store backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`, bounding every operation by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = bounded(timeout, ConnectionManager::new(client)).await?;
        info!(timeout_ms = timeout.as_millis() as u64, "Connected to Redis state store");

        Ok(Self {
            connection,
            timeout,
        })
    }
}

async fn bounded<T, F>(timeout: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout.as_millis() as u64)),
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CounterState>, StoreError> {
        let mut conn = self.connection.clone();
        let payload: Option<String> = bounded(self.timeout, conn.get(key)).await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match CounterState::from_json(&payload) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // Unreadable state is dropped and the key starts over
                warn!(key = %key, error = %e, "Discarding corrupt counter state");
                bounded(self.timeout, conn.del::<_, ()>(key)).await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, state: &CounterState, ttl_secs: u64) -> Result<(), StoreError> {
        let payload = state.to_json().map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let mut conn = self.connection.clone();
        bounded(self.timeout, conn.set_ex::<_, _, ()>(key, payload, ttl_secs.max(1))).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        bounded(self.timeout, conn.del::<_, ()>(key)).await
    }
}
