//! Remote-first store with local fallback.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{LocalStore, StateStore};
use crate::error::StoreError;
use crate::ratelimit::CounterState;

/// Namespace prepended to every resolved key.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// Which store served an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Remote,
    Local,
}

/// Store used by the engine: remote when it works, local when it doesn't.
///
/// Any remote failure (error, timeout, or no remote bound at all) is
/// absorbed here and served from the local map instead. Availability wins
/// over consistency: while the remote is down each instance enforces its
/// own, unshared quota.
#[derive(Debug, Clone)]
pub struct TieredStore {
    remote: Option<Arc<dyn StateStore>>,
    local: Arc<LocalStore>,
    key_prefix: String,
}

impl TieredStore {
    pub fn new(remote: Arc<dyn StateStore>, local: Arc<LocalStore>) -> Self {
        Self {
            remote: Some(remote),
            local,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// A store with no remote binding.
    pub fn local_only(local: Arc<LocalStore>) -> Self {
        warn!("No remote state store bound, quotas are enforced per instance");
        Self {
            remote: None,
            local,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Namespaced key under which `key` is stored.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Load the state for a resolved key; a missing key yields the zero state.
    pub async fn get(&self, key: &str) -> (CounterState, Tier) {
        let storage_key = self.storage_key(key);

        match self.remote_get(&storage_key).await {
            Ok(state) => (state.unwrap_or_default(), Tier::Remote),
            Err(e) => {
                log_fallback(&storage_key, &e, "read");
                (
                    self.local.load(&storage_key).unwrap_or_default(),
                    Tier::Local,
                )
            }
        }
    }

    /// Persist the state for a resolved key.
    pub async fn put(&self, key: &str, state: &CounterState, ttl_secs: u64) -> Tier {
        let storage_key = self.storage_key(key);

        match self.remote_put(&storage_key, state, ttl_secs).await {
            Ok(()) => Tier::Remote,
            Err(e) => {
                log_fallback(&storage_key, &e, "write");
                self.local.store(&storage_key, state.clone());
                Tier::Local
            }
        }
    }

    /// Remove a resolved key from both tiers.
    ///
    /// The local entry is always removed. The remote error, if any, is
    /// returned for the caller to report.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let storage_key = self.storage_key(key);
        self.local.remove(&storage_key);

        match &self.remote {
            Some(remote) => remote.delete(&storage_key).await,
            None => Ok(()),
        }
    }

    async fn remote_get(&self, key: &str) -> Result<Option<CounterState>, StoreError> {
        match &self.remote {
            Some(remote) => remote.get(key).await,
            None => Err(StoreError::Unbound),
        }
    }

    async fn remote_put(
        &self,
        key: &str,
        state: &CounterState,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        match &self.remote {
            Some(remote) => remote.put(key, state, ttl_secs).await,
            None => Err(StoreError::Unbound),
        }
    }
}

fn log_fallback(key: &str, error: &StoreError, op: &str) {
    match error {
        // Already reported once at construction
        StoreError::Unbound => trace!(key = %key, op, "Using local state store"),
        StoreError::Timeout(_) => warn!(
            key = %key,
            op,
            error = %error,
            "Remote store timed out, falling back to local state"
        ),
        _ => warn!(
            key = %key,
            op,
            error = %error,
            "Remote store failed, falling back to local state"
        ),
    }
    debug!(key = %key, op, "Served from local tier");
}
