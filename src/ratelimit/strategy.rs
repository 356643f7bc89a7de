//! Window strategies.
//!
//! A strategy decides whether a request is admitted given the stored
//! [`CounterState`], the policy limits and the current time. Evaluation is
//! pure: it returns the decision together with the normalized state
//! (rolled-over window, expired buckets dropped, tokens refilled) and leaves
//! consuming quota to [`WindowStrategy::record`] and
//! [`WindowStrategy::record_denied`].
//!
//! The state's `reset_at` is when the whole state stops carrying
//! information, which drives store TTL and the local sweep. The decision's
//! `reset_at` is when quota next frees up. They coincide for the fixed
//! window only.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use super::counter::{Bucket, CounterState};
use super::policy::Policy;

/// Default number of sub-window buckets per sliding window.
pub const DEFAULT_SLIDING_PRECISION: u32 = 10;

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Requests left after this one
    pub remaining: u64,
    /// When quota is next available (epoch ms)
    pub reset_at: u64,
}

/// A decision together with the normalized state it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub state: CounterState,
}

/// Throttling algorithm selected by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Windows aligned to multiples of the window duration since epoch
    #[default]
    FixedWindow,
    /// Sum of sub-window buckets over the trailing window
    SlidingWindow,
    /// Continuously refilled bucket of `max_requests` tokens
    TokenBucket,
}

impl Algorithm {
    /// The strategy implementing this algorithm.
    pub fn strategy(&self) -> &'static dyn WindowStrategy {
        match self {
            Algorithm::FixedWindow => &FixedWindow,
            Algorithm::SlidingWindow => &SlidingWindow,
            Algorithm::TokenBucket => &TokenBucket,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluates requests against stored counter state.
pub trait WindowStrategy: Send + Sync + Debug {
    /// Decide on a request without consuming quota.
    fn evaluate(&self, policy: &Policy, state: &CounterState, now_ms: u64) -> Evaluation;

    /// Consume one unit of quota from a normalized state.
    fn record(&self, policy: &Policy, state: &mut CounterState, now_ms: u64);

    /// Account for a denied request.
    ///
    /// Denials count against the window by default.
    fn record_denied(&self, policy: &Policy, state: &mut CounterState, now_ms: u64) {
        self.record(policy, state, now_ms);
    }

    /// Give one unit of quota back.
    fn refund(&self, policy: &Policy, state: &mut CounterState, now_ms: u64);
}

fn remaining_after(max: u64, used: u64, allowed: bool) -> u64 {
    max.saturating_sub(used).saturating_sub(allowed as u64)
}

/// Fixed window counter.
///
/// Rollover is lazy: a stored `reset_at` that does not match the current
/// window boundary means the window has advanced, and the count restarts
/// from zero. Two requests that read the same stale count can both be
/// admitted; the store offers no atomic increment.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

impl FixedWindow {
    /// End of the window containing `now_ms`.
    pub fn window_end(window_ms: u64, now_ms: u64) -> u64 {
        let window_ms = window_ms.max(1);
        (now_ms / window_ms) * window_ms + window_ms
    }
}

impl WindowStrategy for FixedWindow {
    fn evaluate(&self, policy: &Policy, state: &CounterState, now_ms: u64) -> Evaluation {
        let reset_at = Self::window_end(policy.window_ms, now_ms);

        let mut state = state.clone();
        if state.reset_at != reset_at {
            state.count = 0;
            state.reset_at = reset_at;
        }

        let allowed = state.count < policy.max_requests;
        Evaluation {
            decision: Decision {
                allowed,
                remaining: remaining_after(policy.max_requests, state.count, allowed),
                reset_at,
            },
            state,
        }
    }

    fn record(&self, _policy: &Policy, state: &mut CounterState, _now_ms: u64) {
        state.count += 1;
    }

    fn refund(&self, _policy: &Policy, state: &mut CounterState, _now_ms: u64) {
        state.count = state.count.saturating_sub(1);
    }
}

/// Sliding window over sub-window buckets.
///
/// Counts in buckets that started within the trailing window are summed,
/// which smooths the burst a fixed window admits at its boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindow;

impl SlidingWindow {
    fn bucket_ms(policy: &Policy) -> u64 {
        let precision = policy.sliding_precision.max(1) as u64;
        (policy.window_ms / precision).max(1)
    }

    fn bucket_start(policy: &Policy, now_ms: u64) -> u64 {
        let size = Self::bucket_ms(policy);
        (now_ms / size) * size
    }

    /// Recompute `count` and `reset_at` from the bucket list.
    ///
    /// The state lives until its newest bucket leaves the window.
    fn settle(policy: &Policy, state: &mut CounterState, now_ms: u64) {
        let buckets = state.buckets.get_or_insert_with(Vec::new);
        buckets.retain(|b| b.count > 0);

        state.count = buckets.iter().map(|b| b.count).sum();
        let newest = buckets
            .iter()
            .map(|b| b.timestamp)
            .max()
            .unwrap_or_else(|| Self::bucket_start(policy, now_ms));
        state.reset_at = newest + policy.window_ms;
    }

    /// When the oldest live bucket leaves the window and frees quota.
    fn frees_at(policy: &Policy, state: &CounterState, now_ms: u64) -> u64 {
        let oldest = state
            .buckets
            .iter()
            .flatten()
            .map(|b| b.timestamp)
            .min()
            .unwrap_or_else(|| Self::bucket_start(policy, now_ms));
        oldest + policy.window_ms
    }
}

impl WindowStrategy for SlidingWindow {
    fn evaluate(&self, policy: &Policy, state: &CounterState, now_ms: u64) -> Evaluation {
        let mut state = state.clone();
        if let Some(buckets) = state.buckets.as_mut() {
            buckets.retain(|b| b.timestamp + policy.window_ms > now_ms);
        }
        Self::settle(policy, &mut state, now_ms);

        let allowed = state.count < policy.max_requests;
        Evaluation {
            decision: Decision {
                allowed,
                remaining: remaining_after(policy.max_requests, state.count, allowed),
                reset_at: Self::frees_at(policy, &state, now_ms),
            },
            state,
        }
    }

    fn record(&self, policy: &Policy, state: &mut CounterState, now_ms: u64) {
        let start = Self::bucket_start(policy, now_ms);
        let buckets = state.buckets.get_or_insert_with(Vec::new);
        match buckets.iter_mut().find(|b| b.timestamp == start) {
            Some(bucket) => bucket.count += 1,
            None => buckets.push(Bucket {
                timestamp: start,
                count: 1,
            }),
        }
        Self::settle(policy, state, now_ms);
    }

    fn refund(&self, policy: &Policy, state: &mut CounterState, now_ms: u64) {
        let newest = state.buckets.as_mut().and_then(|buckets| {
            buckets
                .iter_mut()
                .filter(|b| b.count > 0)
                .max_by_key(|b| b.timestamp)
        });
        if let Some(bucket) = newest {
            bucket.count -= 1;
        }
        Self::settle(policy, state, now_ms);
    }
}

/// Token bucket with capacity `max_requests`, refilled evenly over the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

impl TokenBucket {
    fn capacity(policy: &Policy) -> f64 {
        policy.max_requests as f64
    }

    /// Tokens refilled over `elapsed_ms`.
    fn refilled(policy: &Policy, elapsed_ms: u64) -> f64 {
        elapsed_ms as f64 * policy.max_requests as f64 / policy.window_ms.max(1) as f64
    }

    /// When the bucket holds `target` tokens again, starting from `tokens`.
    fn time_to(policy: &Policy, tokens: f64, target: f64, now_ms: u64) -> u64 {
        let missing = (target - tokens).max(0.0);
        let ms = missing * policy.window_ms as f64 / policy.max_requests.max(1) as f64;
        now_ms + ms.ceil() as u64
    }

    fn settle(policy: &Policy, state: &mut CounterState, tokens: f64, now_ms: u64) {
        let capacity = Self::capacity(policy);
        state.tokens = Some(tokens);
        state.count = (capacity - tokens).max(0.0).ceil() as u64;
        state.reset_at = Self::time_to(policy, tokens, capacity, now_ms);
    }
}

impl WindowStrategy for TokenBucket {
    fn evaluate(&self, policy: &Policy, state: &CounterState, now_ms: u64) -> Evaluation {
        let capacity = Self::capacity(policy);
        let last_refill = state.last_refill.unwrap_or(now_ms);
        let elapsed = now_ms.saturating_sub(last_refill);
        let tokens = state
            .tokens
            .map(|t| (t + Self::refilled(policy, elapsed)).min(capacity))
            .unwrap_or(capacity);

        let mut state = state.clone();
        state.last_refill = Some(now_ms);
        Self::settle(policy, &mut state, tokens, now_ms);

        let allowed = tokens >= 1.0;
        let reset_at = if allowed {
            Self::time_to(policy, tokens - 1.0, capacity, now_ms)
        } else {
            Self::time_to(policy, tokens, 1.0, now_ms)
        };

        Evaluation {
            decision: Decision {
                allowed,
                remaining: (tokens - allowed as u8 as f64).max(0.0).floor() as u64,
                reset_at,
            },
            state,
        }
    }

    fn record(&self, policy: &Policy, state: &mut CounterState, now_ms: u64) {
        let tokens = (state.tokens.unwrap_or(Self::capacity(policy)) - 1.0).max(0.0);
        Self::settle(policy, state, tokens, now_ms);
    }

    /// Denials consume nothing; the refilled state from `evaluate` is kept
    /// as is so fractional refill is not lost.
    fn record_denied(&self, _policy: &Policy, _state: &mut CounterState, _now_ms: u64) {}

    fn refund(&self, policy: &Policy, state: &mut CounterState, now_ms: u64) {
        let capacity = Self::capacity(policy);
        let tokens = (state.tokens.unwrap_or(capacity) + 1.0).min(capacity);
        Self::settle(policy, state, tokens, now_ms);
    }
}
