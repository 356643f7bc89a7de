//! Out-of-band operations on throttling state.

use std::sync::Arc;
use tracing::{info, warn};

use super::counter::CounterState;
use crate::clock::Clock;
use crate::store::{Tier, TieredStore};

/// Administrative access to the counter store.
#[derive(Debug, Clone)]
pub struct AdminOps {
    store: TieredStore,
    clock: Arc<dyn Clock>,
}

impl AdminOps {
    pub fn new(store: TieredStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Forget all throttling state for a resolved key such as `user:42`.
    ///
    /// The local entry is always removed. A remote failure is logged and
    /// reported as `false`; it is never raised. Resetting an absent key
    /// succeeds.
    pub async fn reset(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(()) => {
                info!(key = %key, "Reset rate limit state");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to reset remote rate limit state");
                false
            }
        }
    }

    /// Stored state for a resolved key, or `None` if the key holds nothing
    /// live.
    pub async fn inspect(&self, key: &str) -> (Option<CounterState>, Tier) {
        let (state, tier) = self.store.get(key).await;
        if state.is_fresh() || state.is_expired(self.clock.now_ms()) {
            (None, tier)
        } else {
            (Some(state), tier)
        }
    }
}
