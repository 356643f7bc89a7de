//! End-to-end behavior of the throttling engine against in-process stores.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use floodgate::clock::MockClock;
use floodgate::ratelimit::{
    Admission, Algorithm, BasicResponse, CallerContext, CounterState, Identity, Policy,
    PolicyRegistry, RateLimiter, HEADER_LIMIT, HEADER_REMAINING, HEADER_RETRY_AFTER,
};
use floodgate::store::{LocalStore, StateStore, Tier, TieredStore};
use floodgate::StoreError;

/// Remote that is always down.
#[derive(Debug)]
struct DownStore;

#[async_trait]
impl StateStore for DownStore {
    async fn get(&self, _key: &str) -> Result<Option<CounterState>, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn put(&self, _key: &str, _state: &CounterState, _ttl: u64) -> Result<(), StoreError> {
        Err(StoreError::Timeout(250))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }
}

/// Remote that counts every operation.
#[derive(Debug)]
struct CountingStore {
    inner: LocalStore,
    calls: AtomicUsize,
}

impl CountingStore {
    fn new(clock: &MockClock) -> Self {
        Self {
            inner: LocalStore::with_sweep_probability(Arc::new(clock.clone()), 0.0),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<CounterState>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, state: &CounterState, ttl: u64) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, state, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }
}

fn local(clock: &MockClock) -> Arc<LocalStore> {
    Arc::new(LocalStore::with_sweep_probability(Arc::new(clock.clone()), 0.0))
}

fn engine(clock: &MockClock, remote: Option<Arc<dyn StateStore>>) -> RateLimiter {
    let store = match remote {
        Some(remote) => TieredStore::new(remote, local(clock)),
        None => TieredStore::local_only(local(clock)),
    };
    RateLimiter::with_clock(store, Arc::new(clock.clone()))
}

/// Local-only engine whose store sweeps expired entries on every read.
fn sweeping_engine(clock: &MockClock) -> RateLimiter {
    let local = Arc::new(LocalStore::with_sweep_probability(Arc::new(clock.clone()), 1.0));
    RateLimiter::with_clock(TieredStore::local_only(local), Arc::new(clock.clone()))
}

fn user(id: &str) -> CallerContext {
    CallerContext::new("/api/items").with_identity(Identity::new(id))
}

#[tokio::test]
async fn test_three_per_minute() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, None);
    let policy = Policy::new(3, 60_000);

    for expected in [2, 1, 0] {
        let outcome = limiter
            .handle(&policy, &user("42"), || async { BasicResponse::new(200) })
            .await;
        let response = outcome.forwarded().unwrap();
        assert_eq!(response.header(HEADER_LIMIT), Some("3"));
        assert_eq!(response.header(HEADER_REMAINING), Some(expected.to_string().as_str()));
        clock.advance(Duration::from_secs(10));
    }

    let calls = AtomicUsize::new(0);
    let invoked = &calls;
    let outcome = limiter
        .handle(&policy, &user("42"), move || async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            BasicResponse::new(200)
        })
        .await;

    let denial = outcome.limited().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(denial.status, 429);
    assert_eq!(denial.header(HEADER_REMAINING), Some("0"));
    assert_eq!(denial.header(HEADER_RETRY_AFTER), Some("30"));
    assert_eq!(denial.body.error, "RATE_LIMIT_EXCEEDED");
    assert_eq!(denial.body.details.limit, 3);
    assert_eq!(denial.body.details.window, 60_000);
    assert_eq!(denial.body.details.reset_time, "1970-01-01T00:01:00.000Z");

    clock.set(70_000);
    let outcome = limiter
        .handle(&policy, &user("42"), || async { BasicResponse::new(200) })
        .await;
    assert_eq!(outcome.forwarded().unwrap().header(HEADER_REMAINING), Some("2"));
}

#[tokio::test]
async fn test_remaining_decreases_to_zero() {
    let clock = MockClock::new(5_000);
    let limiter = engine(&clock, None);
    let policy = Policy::new(10, 60_000);

    for i in 0..10u64 {
        match limiter.check(&policy, &user("7")).await {
            Admission::Allowed { decision, .. } => assert_eq!(decision.remaining, 9 - i),
            other => panic!("expected allowed, got {:?}", other),
        }
    }
    assert!(!limiter.check(&policy, &user("7")).await.is_admitted());
}

#[tokio::test]
async fn test_rollover_restarts_count() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, None);
    let policy = Policy::new(2, 60_000);

    limiter.check(&policy, &user("1")).await;
    limiter.check(&policy, &user("1")).await;
    limiter.check(&policy, &user("1")).await;
    assert_eq!(limiter.store().get("user:1").await.0.count, 3);

    clock.set(61_000);
    limiter.check(&policy, &user("1")).await;

    let (state, _) = limiter.store().get("user:1").await;
    assert_eq!(state.count, 1);
    assert_eq!(state.reset_at, 120_000);
}

#[tokio::test]
async fn test_anonymous_callers_keyed_by_address() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, None);
    let policy = Policy::new(1, 60_000);

    let first = CallerContext::new("/").with_header("X-Forwarded-For", "203.0.113.9, 10.0.0.1");
    let second = CallerContext::new("/").with_header("x-real-ip", "198.51.100.4");

    assert!(matches!(
        limiter.check(&policy, &first).await,
        Admission::Allowed { ref key, .. } if key == "ip:203.0.113.9"
    ));
    assert!(limiter.check(&policy, &second).await.is_admitted());
    assert!(!limiter.check(&policy, &first).await.is_admitted());

    let nobody = CallerContext::new("/");
    assert!(matches!(
        limiter.check(&policy, &nobody).await,
        Admission::Allowed { ref key, .. } if key == "ip:unknown"
    ));
}

#[tokio::test]
async fn test_reset_restores_quota() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, None);
    let policy = Policy::new(1, 60_000);

    limiter.check(&policy, &user("9")).await;
    assert!(!limiter.check(&policy, &user("9")).await.is_admitted());

    let admin = limiter.admin();
    assert!(admin.reset("user:9").await);
    assert!(admin.reset("user:9").await);
    assert!(admin.reset("user:never-seen").await);

    assert!(limiter.check(&policy, &user("9")).await.is_admitted());
}

#[tokio::test]
async fn test_remote_outage_enforces_locally() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, Some(Arc::new(DownStore)));
    let policy = Policy::new(2, 60_000);

    for _ in 0..2 {
        match limiter.check(&policy, &user("5")).await {
            Admission::Allowed { tier, .. } => assert_eq!(tier, Tier::Local),
            other => panic!("expected allowed, got {:?}", other),
        }
    }
    assert!(matches!(
        limiter.check(&policy, &user("5")).await,
        Admission::Denied { tier: Tier::Local, .. }
    ));

    // Local state is cleared even though the remote delete fails
    assert!(!limiter.admin().reset("user:5").await);
    assert!(limiter.check(&policy, &user("5")).await.is_admitted());
}

#[tokio::test]
async fn test_skip_predicate_never_touches_store() {
    let clock = MockClock::new(0);
    let remote = Arc::new(CountingStore::new(&clock));
    let limiter = engine(&clock, Some(remote.clone()));
    let policy = Policy::new(1, 60_000).with_skip(|ctx| ctx.path == "/health");

    for _ in 0..5 {
        let ctx = CallerContext::new("/health");
        assert_eq!(limiter.check(&policy, &ctx).await, Admission::Bypassed);
    }
    assert_eq!(remote.calls(), 0);
    assert!(limiter.store().local().is_empty());

    limiter.check(&policy, &user("1")).await;
    assert_eq!(remote.calls(), 2);
}

#[tokio::test]
async fn test_api_preset_bypasses_admins() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, None);
    let registry = PolicyRegistry::new();

    let admin = CallerContext::new("/").with_identity(Identity::new("root").with_role("admin"));
    assert_eq!(
        limiter.check(registry.get("api"), &admin).await,
        Admission::Bypassed
    );
    assert!(matches!(
        limiter.check(registry.get("api"), &user("1")).await,
        Admission::Allowed { .. }
    ));
}

#[tokio::test]
async fn test_skip_successful_counts_only_failures() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, None);
    let policy = Policy::new(2, 60_000).with_skip_successful(true);

    for _ in 0..5 {
        let outcome = limiter
            .handle(&policy, &user("1"), || async { BasicResponse::new(204) })
            .await;
        assert!(!outcome.is_limited());
    }
    assert_eq!(limiter.store().get("user:1").await.0.count, 0);

    for _ in 0..2 {
        let outcome = limiter
            .handle(&policy, &user("1"), || async { BasicResponse::new(401) })
            .await;
        assert!(!outcome.is_limited());
    }
    let outcome = limiter
        .handle(&policy, &user("1"), || async { BasicResponse::new(401) })
        .await;
    assert!(outcome.is_limited());
}

#[tokio::test]
async fn test_engines_share_remote_quota() {
    let clock = MockClock::new(0);
    let shared: Arc<dyn StateStore> = Arc::new(LocalStore::with_sweep_probability(
        Arc::new(clock.clone()),
        0.0,
    ));
    let a = engine(&clock, Some(shared.clone()));
    let b = engine(&clock, Some(shared.clone()));
    let policy = Policy::new(3, 60_000);

    assert!(a.check(&policy, &user("1")).await.is_admitted());
    assert!(b.check(&policy, &user("1")).await.is_admitted());
    match a.check(&policy, &user("1")).await {
        Admission::Allowed { decision, tier, .. } => {
            assert_eq!(decision.remaining, 0);
            assert_eq!(tier, Tier::Remote);
        }
        other => panic!("expected allowed, got {:?}", other),
    }
    assert!(!b.check(&policy, &user("1")).await.is_admitted());

    // Stored under the namespaced key
    let stored = shared.get("ratelimit:user:1").await.unwrap();
    assert_eq!(stored.map(|s| s.count), Some(4));

    // Reset through one engine frees the caller on the other
    assert!(a.admin().reset("user:1").await);
    assert!(b.check(&policy, &user("1")).await.is_admitted());
}

#[tokio::test]
async fn test_sliding_window_keeps_live_buckets_through_sweep() {
    let clock = MockClock::new(0);
    let limiter = sweeping_engine(&clock);
    let policy = Policy::new(4, 1_000).with_algorithm(Algorithm::SlidingWindow);

    for t in [0, 0, 900, 900] {
        clock.set(t);
        assert!(limiter.check(&policy, &user("1")).await.is_admitted());
    }
    let (state, _) = limiter.store().get("user:1").await;
    assert_eq!(state.reset_at, 1_900);

    // The bucket at 0 has left the window, the two hits at 900 still count
    clock.set(1_001);
    let mut admitted = 0;
    for _ in 0..5 {
        if limiter.check(&policy, &user("1")).await.is_admitted() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 2);

    // Denials counted in the bucket at 1000, which leaves at 2000
    clock.set(1_950);
    assert!(!limiter.check(&policy, &user("1")).await.is_admitted());

    clock.set(2_000);
    match limiter.check(&policy, &user("1")).await {
        Admission::Allowed { decision, .. } => assert_eq!(decision.remaining, 3),
        other => panic!("expected allowed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_token_bucket_polling_below_refill_rate() {
    let clock = MockClock::new(0);
    let limiter = sweeping_engine(&clock);
    let policy = Policy::new(1, 1_000).with_algorithm(Algorithm::TokenBucket);

    assert!(limiter.check(&policy, &user("1")).await.is_admitted());

    let mut polls = Vec::new();
    for t in (500..=3_000).step_by(500) {
        clock.set(t);
        polls.push((t, limiter.check(&policy, &user("1")).await.is_admitted()));
    }
    assert_eq!(
        polls,
        vec![
            (500, false),
            (1_000, true),
            (1_500, false),
            (2_000, true),
            (2_500, false),
            (3_000, true),
        ]
    );
}

#[tokio::test]
async fn test_token_bucket_denial_then_recovery() {
    let clock = MockClock::new(0);
    let limiter = engine(&clock, None);
    let policy = Policy::new(2, 2_000).with_algorithm(Algorithm::TokenBucket);

    for expected in ["1", "0"] {
        let outcome = limiter
            .handle(&policy, &user("1"), || async { BasicResponse::new(200) })
            .await;
        assert_eq!(outcome.forwarded().unwrap().header(HEADER_REMAINING), Some(expected));
    }

    clock.set(400);
    match limiter.check(&policy, &user("1")).await {
        Admission::Denied { response, .. } => assert_eq!(response.retry_after(), Some(1)),
        other => panic!("expected denied, got {:?}", other),
    }

    // One token per second; the denial above did not consume the partial refill
    clock.set(1_100);
    assert!(limiter.check(&policy, &user("1")).await.is_admitted());
    assert!(!limiter.check(&policy, &user("1")).await.is_admitted());
}
