//! Rate limiting logic and state management.

mod admin;
mod counter;
mod key;
mod limiter;
pub mod policy;
mod response;
mod strategy;

pub use admin::AdminOps;
pub use counter::{seconds_until, Bucket, CounterState, MIN_TTL_SECS};
pub use key::{
    ApiKeyResolver, CallerContext, DefaultKeyResolver, FnKeyResolver, Identity, KeyResolver,
    SharedKeyResolver, TenantKeyResolver, DEFAULT_ADDRESS_HEADERS, UNKNOWN_ADDRESS,
};
pub use limiter::{Admission, Outcome, RateLimiter};
pub use policy::{KeyScheme, Policy, PolicyOverrides, PolicyRegistry, SkipPredicate};
pub use response::{
    iso8601, BasicResponse, DenialBody, DenialDetails, HttpResponse, RateLimitHeaders,
    RateLimitedResponse, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
    RATE_LIMIT_EXCEEDED,
};
pub use strategy::{
    Algorithm, Decision, Evaluation, FixedWindow, SlidingWindow, TokenBucket, WindowStrategy,
    DEFAULT_SLIDING_PRECISION,
};
