//! The throttling engine.
//!
//! For every request: resolve the key, load its state, let the policy's
//! strategy decide, persist, then either forward to the downstream handler
//! or short-circuit with a denial. Throttling must never take the protected
//! service down with it, so every internal failure fails open.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::admin::AdminOps;
use super::key::CallerContext;
use super::policy::Policy;
use super::response::{HttpResponse, RateLimitHeaders, RateLimitedResponse};
use super::strategy::{Decision, Evaluation};
use crate::clock::{Clock, SystemClock};
use crate::error::{FloodgateError, Result};
use crate::store::{Tier, TieredStore};

/// Result of the throttling check for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The policy's skip predicate matched; nothing was read or written
    Bypassed,
    /// The engine failed internally and lets the request through unthrottled
    FailedOpen,
    /// Within quota
    Allowed {
        key: String,
        decision: Decision,
        headers: RateLimitHeaders,
        tier: Tier,
    },
    /// Over quota
    Denied {
        key: String,
        decision: Decision,
        response: RateLimitedResponse,
        tier: Tier,
    },
}

impl Admission {
    /// Whether the downstream handler should run.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Denied { .. })
    }
}

/// What the HTTP layer should send back.
#[derive(Debug)]
pub enum Outcome<R> {
    /// The downstream handler ran and produced this response
    Forwarded(R),
    /// The request was denied without invoking the downstream handler
    Limited(RateLimitedResponse),
}

impl<R> Outcome<R> {
    pub fn is_limited(&self) -> bool {
        matches!(self, Outcome::Limited(_))
    }

    pub fn forwarded(self) -> Option<R> {
        match self {
            Outcome::Forwarded(response) => Some(response),
            Outcome::Limited(_) => None,
        }
    }

    pub fn limited(self) -> Option<RateLimitedResponse> {
        match self {
            Outcome::Forwarded(_) => None,
            Outcome::Limited(response) => Some(response),
        }
    }
}

/// The throttling engine.
///
/// Cheap to share: wrap it in an `Arc` and hand it to every request
/// handler. The store it is built with is the single per-process state
/// handle.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: TieredStore,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create an engine over `store` using the system clock.
    pub fn new(store: TieredStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(store: TieredStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    /// Out-of-band operations sharing this engine's store.
    pub fn admin(&self) -> AdminOps {
        AdminOps::new(self.store.clone(), self.clock.clone())
    }

    /// Throttle one request around `next`.
    ///
    /// `next` runs at most once: not at all when the request is denied,
    /// exactly once otherwise, including when the engine fails.
    pub async fn handle<F, Fut, R>(
        &self,
        policy: &Policy,
        ctx: &CallerContext,
        next: F,
    ) -> Outcome<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
        R: HttpResponse,
    {
        match self.check(policy, ctx).await {
            Admission::Denied { response, .. } => Outcome::Limited(response),
            Admission::Bypassed | Admission::FailedOpen => Outcome::Forwarded(next().await),
            Admission::Allowed { key, headers, .. } => {
                let mut response = next().await;
                headers.apply(&mut response, policy.emit_headers);

                if policy.skip_successful && response.status() < 400 {
                    self.release(policy, &key).await;
                }
                Outcome::Forwarded(response)
            }
        }
    }

    /// Run the throttling check without a downstream handler.
    ///
    /// Admitted requests have already consumed quota when this returns.
    pub async fn check(&self, policy: &Policy, ctx: &CallerContext) -> Admission {
        match AssertUnwindSafe(self.admit(policy, ctx)).catch_unwind().await {
            Ok(Ok(admission)) => admission,
            Ok(Err(e)) => {
                error!(error = %e, path = %ctx.path, "Rate limiter failed, allowing request");
                Admission::FailedOpen
            }
            Err(_) => {
                error!(path = %ctx.path, "Rate limiter panicked, allowing request");
                Admission::FailedOpen
            }
        }
    }

    /// Evaluate `key` against `policy` without consuming quota.
    pub async fn peek(&self, policy: &Policy, key: &str) -> Decision {
        let now = self.clock.now_ms();
        let (stored, _) = self.store.get(key).await;
        policy.algorithm.strategy().evaluate(policy, &stored, now).decision
    }

    async fn admit(&self, policy: &Policy, ctx: &CallerContext) -> Result<Admission> {
        if policy.should_skip(ctx) {
            trace!(path = %ctx.path, "Skip predicate matched, bypassing rate limit");
            return Ok(Admission::Bypassed);
        }

        policy
            .validate()
            .map_err(|e| FloodgateError::Engine(format!("unenforceable policy: {}", e)))?;

        let key = policy.key_resolver.resolve(ctx);
        let now = self.clock.now_ms();

        trace!(key = %key, path = %ctx.path, "Checking rate limit");

        let (stored, tier) = self.store.get(&key).await;
        if stored.is_fresh() {
            debug!(
                key = %key,
                limit = policy.max_requests,
                window_ms = policy.window_ms,
                algorithm = %policy.algorithm,
                "Creating new rate limit counter"
            );
        }

        let strategy = policy.algorithm.strategy();
        let Evaluation {
            decision,
            mut state,
        } = strategy.evaluate(policy, &stored, now);

        if decision.allowed {
            strategy.record(policy, &mut state, now);
            let tier = self.store.put(&key, &state, state.ttl_secs(now)).await;

            return Ok(Admission::Allowed {
                headers: RateLimitHeaders::allowed(policy, &decision),
                key,
                decision,
                tier,
            });
        }

        let tier = if policy.skip_failed {
            tier
        } else {
            strategy.record_denied(policy, &mut state, now);
            self.store.put(&key, &state, state.ttl_secs(now)).await
        };

        debug!(
            key = %key,
            count = state.count,
            limit = policy.max_requests,
            reset_at = decision.reset_at,
            "Rate limit exceeded"
        );

        Ok(Admission::Denied {
            response: RateLimitedResponse::new(policy, &decision, now),
            key,
            decision,
            tier,
        })
    }

    /// Give one unit back after a successful downstream response.
    ///
    /// Re-reads and re-writes the state, so a concurrent request on the same
    /// key can lose this refund or have its own increment overwritten. The
    /// refund is approximate by nature; a store with compare-and-swap could
    /// make it exact without changing this interface.
    async fn release(&self, policy: &Policy, key: &str) {
        let now = self.clock.now_ms();
        let (stored, _) = self.store.get(key).await;

        let strategy = policy.algorithm.strategy();
        let mut state = strategy.evaluate(policy, &stored, now).state;
        strategy.refund(policy, &mut state, now);

        self.store.put(key, &state, state.ttl_secs(now)).await;
        trace!(key = %key, count = state.count, "Refunded successful request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::key::{FnKeyResolver, Identity};
    use crate::ratelimit::response::{BasicResponse, HEADER_REMAINING};
    use crate::store::LocalStore;

    fn limiter() -> (RateLimiter, MockClock) {
        let clock = MockClock::new(0);
        let local = Arc::new(LocalStore::with_sweep_probability(Arc::new(clock.clone()), 0.0));
        let store = TieredStore::local_only(local);
        (RateLimiter::with_clock(store, Arc::new(clock.clone())), clock)
    }

    fn ctx(user: &str) -> CallerContext {
        CallerContext::new("/api").with_identity(Identity::new(user))
    }

    async fn stored_count(limiter: &RateLimiter, key: &str) -> u64 {
        limiter.store().get(key).await.0.count
    }

    #[tokio::test]
    async fn test_check_creates_counter() {
        let (limiter, _) = limiter();
        let policy = Policy::new(10, 1_000);

        let admission = limiter.check(&policy, &ctx("1")).await;

        assert!(matches!(admission, Admission::Allowed { ref key, .. } if key == "user:1"));
        assert_eq!(limiter.store().local().len(), 1);
    }

    #[tokio::test]
    async fn test_check_increments() {
        let (limiter, _) = limiter();
        let policy = Policy::new(10, 1_000);

        limiter.check(&policy, &ctx("1")).await;
        assert_eq!(stored_count(&limiter, "user:1").await, 1);

        limiter.check(&policy, &ctx("1")).await;
        assert_eq!(stored_count(&limiter, "user:1").await, 2);
    }

    #[tokio::test]
    async fn test_limit_enforced() {
        let (limiter, _) = limiter();
        let policy = Policy::new(5, 1_000);

        for _ in 0..5 {
            assert!(limiter.check(&policy, &ctx("1")).await.is_admitted());
        }
        assert!(!limiter.check(&policy, &ctx("1")).await.is_admitted());
    }

    #[tokio::test]
    async fn test_different_callers_have_separate_counters() {
        let (limiter, _) = limiter();
        let policy = Policy::new(10, 1_000);

        for _ in 0..5 {
            limiter.check(&policy, &ctx("a")).await;
        }
        for _ in 0..3 {
            limiter.check(&policy, &ctx("b")).await;
        }

        assert_eq!(stored_count(&limiter, "user:a").await, 5);
        assert_eq!(stored_count(&limiter, "user:b").await, 3);
    }

    #[tokio::test]
    async fn test_denied_counts_unless_skip_failed() {
        let (limiter, _) = limiter();
        let policy = Policy::new(1, 1_000);

        limiter.check(&policy, &ctx("1")).await;
        limiter.check(&policy, &ctx("1")).await;
        assert_eq!(stored_count(&limiter, "user:1").await, 2);

        let lenient = policy.clone().with_skip_failed(true);
        limiter.check(&lenient, &ctx("2")).await;
        limiter.check(&lenient, &ctx("2")).await;
        assert_eq!(stored_count(&limiter, "user:2").await, 1);
    }

    #[tokio::test]
    async fn test_handle_applies_headers() {
        let (limiter, _) = limiter();
        let policy = Policy::new(3, 60_000);

        let outcome = limiter
            .handle(&policy, &ctx("1"), || async { BasicResponse::new(200) })
            .await;

        let response = outcome.forwarded().unwrap();
        assert_eq!(response.header(HEADER_REMAINING), Some("2"));
    }

    #[tokio::test]
    async fn test_invalid_policy_fails_open() {
        let (limiter, _) = limiter();
        let policy = Policy::new(0, 1_000);

        assert_eq!(limiter.check(&policy, &ctx("1")).await, Admission::FailedOpen);
        assert!(limiter.store().local().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_resolver_fails_open() {
        let (limiter, _) = limiter();
        let policy = Policy::new(1, 1_000).with_key_resolver(Arc::new(FnKeyResolver::new(
            "broken",
            |_: &CallerContext| -> String { panic!("resolver bug") },
        )));

        let outcome = limiter
            .handle(&policy, &ctx("1"), || async { BasicResponse::new(201) })
            .await;
        assert_eq!(outcome.forwarded().map(|r| r.status), Some(201));
    }

    #[tokio::test]
    async fn test_panicking_skip_predicate_fails_open() {
        let (limiter, _) = limiter();
        let policy = Policy::new(1, 1_000).with_skip(|_| panic!("predicate bug"));

        assert_eq!(limiter.check(&policy, &ctx("1")).await, Admission::FailedOpen);
        let outcome = limiter
            .handle(&policy, &ctx("1"), || async { BasicResponse::new(200) })
            .await;
        assert_eq!(outcome.forwarded().map(|r| r.status), Some(200));
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (limiter, _) = limiter();
        let policy = Policy::new(2, 1_000);

        limiter.check(&policy, &ctx("1")).await;
        let decision = limiter.peek(&policy, "user:1").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(stored_count(&limiter, "user:1").await, 1);
    }
}
