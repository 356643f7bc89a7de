//! Counter state storage.
//!
//! [`StateStore`] abstracts over the shared remote store and the
//! in-process [`LocalStore`]. The engine talks to a [`TieredStore`], which
//! tries the remote first and falls back to local state on any failure.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::StoreError;
use crate::ratelimit::CounterState;

mod local;
#[cfg(feature = "redis")]
mod redis_store;
mod tiered;

pub use local::{LocalStore, DEFAULT_SWEEP_PROBABILITY};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use tiered::{Tier, TieredStore, DEFAULT_KEY_PREFIX};

/// Key/value storage for counter state with per-entry TTL.
///
/// Implementations are shared by every in-flight request, and across
/// process instances for remote stores. Read-modify-write sequences are not
/// atomic: the last write wins.
#[async_trait]
pub trait StateStore: Send + Sync + Debug {
    /// Load the state stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<CounterState>, StoreError>;

    /// Store `state` under `key`, expiring after `ttl_secs`.
    async fn put(&self, key: &str, state: &CounterState, ttl_secs: u64) -> Result<(), StoreError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
