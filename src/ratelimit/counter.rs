//! Persisted counter state for a single throttling key.

use serde::{Deserialize, Serialize};

/// Minimum TTL applied to persisted state, in seconds.
pub const MIN_TTL_SECS: u64 = 60;

/// A sub-window bucket used by the sliding window strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Start of the sub-window (epoch ms)
    pub timestamp: u64,
    /// Requests recorded in the sub-window
    pub count: u64,
}

/// Counter state stored per key.
///
/// The serialized form is the wire payload shared by every instance:
/// `{"count", "resetTime", "tokens"?, "lastRefill"?, "buckets"?}`.
/// A state is created lazily the first time a key is evaluated and is
/// never deleted explicitly; it ages out through store TTL or the local
/// sweep once `reset_at` has passed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterState {
    /// Units consumed in the current window
    pub count: u64,
    /// When the state stops carrying information (epoch ms); 0 for a fresh
    /// state. Drives store TTL and the local sweep.
    #[serde(rename = "resetTime")]
    pub reset_at: u64,
    /// Remaining tokens (token bucket only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<f64>,
    /// Last refill time (token bucket only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refill: Option<u64>,
    /// Sub-window buckets (sliding window only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<Bucket>>,
}

impl CounterState {
    /// Whether this state has never been written.
    pub fn is_fresh(&self) -> bool {
        self.reset_at == 0 && self.count == 0 && self.tokens.is_none() && self.buckets.is_none()
    }

    /// Whether the state no longer carries information at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.reset_at <= now_ms
    }

    /// Seconds until `reset_at`, rounded up.
    pub fn seconds_until_reset(&self, now_ms: u64) -> u64 {
        seconds_until(self.reset_at, now_ms)
    }

    /// TTL to persist this state with: never below [`MIN_TTL_SECS`].
    pub fn ttl_secs(&self, now_ms: u64) -> u64 {
        self.seconds_until_reset(now_ms).max(MIN_TTL_SECS)
    }

    /// Encode to the JSON wire payload.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from the JSON wire payload.
    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// Seconds from `now_ms` until `at_ms`, rounded up, zero if already past.
pub fn seconds_until(at_ms: u64, now_ms: u64) -> u64 {
    at_ms.saturating_sub(now_ms).div_ceil(1000)
}
