//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tracing::trace;

use super::StateStore;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::ratelimit::CounterState;

/// Chance that a read sweeps expired entries.
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.01;

/// Process-local counter store.
///
/// Not shared across instances. Memory stays bounded without a background
/// task: a small fraction of reads sweep every entry whose `reset_at` has
/// passed.
#[derive(Debug)]
pub struct LocalStore {
    entries: DashMap<String, CounterState>,
    clock: Arc<dyn Clock>,
    sweep_probability: f64,
}

impl LocalStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_sweep_probability(clock, DEFAULT_SWEEP_PROBABILITY)
    }

    /// Sweep on `probability` of reads, clamped to `0.0..=1.0`.
    pub fn with_sweep_probability(clock: Arc<dyn Clock>, probability: f64) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            sweep_probability: probability.clamp(0.0, 1.0),
        }
    }

    /// Load a copy of the state under `key`.
    pub fn load(&self, key: &str) -> Option<CounterState> {
        self.maybe_sweep();
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn store(&self, key: &str, state: CounterState) {
        self.entries.insert(key.to_string(), state);
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry whose window has ended. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&self) {
        if self.sweep_probability > 0.0 && rand::thread_rng().gen_bool(self.sweep_probability) {
            let removed = self.sweep();
            trace!(removed, remaining = self.entries.len(), "Swept expired local counters");
        }
    }
}

#[async_trait]
impl StateStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<CounterState>, StoreError> {
        Ok(self.load(key))
    }

    /// TTL is ignored; expiry follows `reset_at`.
    async fn put(&self, key: &str, state: &CounterState, _ttl_secs: u64) -> Result<(), StoreError> {
        self.store(key, state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.remove(key);
        Ok(())
    }
}
