//! Response metadata produced by the engine.
//!
//! The engine does not own an HTTP stack. Admitted requests get
//! `X-RateLimit-*` headers applied to whatever response the downstream
//! handler produced, through [`HttpResponse`]. Denied requests produce a
//! complete [`RateLimitedResponse`] for the HTTP layer to send.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::counter::seconds_until;
use super::policy::Policy;
use super::strategy::Decision;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Error code carried in every denial body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Minimal view of a downstream response the engine can decorate.
pub trait HttpResponse {
    /// HTTP status code.
    fn status(&self) -> u16;

    /// Set or replace a header.
    fn set_header(&mut self, name: &str, value: String);
}

/// Plain response type for callers without a framework response at hand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl BasicResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl HttpResponse for BasicResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn set_header(&mut self, name: &str, value: String) {
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(header) => header.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }
}

/// Quota metadata for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds
    pub reset_at: u64,
    /// Seconds, only set on denial
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn allowed(policy: &Policy, decision: &Decision) -> Self {
        Self {
            limit: policy.max_requests,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            retry_after: None,
        }
    }

    pub fn denied(policy: &Policy, decision: &Decision, now_ms: u64) -> Self {
        Self {
            limit: policy.max_requests,
            remaining: 0,
            reset_at: decision.reset_at,
            retry_after: Some(seconds_until(decision.reset_at, now_ms)),
        }
    }

    /// Header name/value pairs. `Retry-After` is always included when set;
    /// the `X-RateLimit-*` headers only when `emit_headers` is on.
    pub fn to_pairs(&self, emit_headers: bool) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);
        if emit_headers {
            pairs.push((HEADER_LIMIT, self.limit.to_string()));
            pairs.push((HEADER_REMAINING, self.remaining.to_string()));
            pairs.push((HEADER_RESET, self.reset_at.to_string()));
        }
        if let Some(retry_after) = self.retry_after {
            pairs.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }

    /// Apply the headers to a downstream response.
    pub fn apply<R: HttpResponse>(&self, response: &mut R, emit_headers: bool) {
        for (name, value) in self.to_pairs(emit_headers) {
            response.set_header(name, value);
        }
    }
}

/// JSON body of a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenialBody {
    pub success: bool,
    pub error: String,
    pub message: String,
    pub details: DenialDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialDetails {
    pub limit: u64,
    /// Window length in milliseconds
    pub window: u64,
    /// ISO 8601 timestamp of the reset
    pub reset_time: String,
}

/// A complete short-circuit response for a denied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitedResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: DenialBody,
}

impl RateLimitedResponse {
    pub fn new(policy: &Policy, decision: &Decision, now_ms: u64) -> Self {
        let headers = RateLimitHeaders::denied(policy, decision, now_ms);
        Self {
            status: policy.status_code,
            headers: headers.to_pairs(policy.emit_headers),
            body: DenialBody {
                success: false,
                error: RATE_LIMIT_EXCEEDED.to_string(),
                message: policy.message.clone(),
                details: DenialDetails {
                    limit: policy.max_requests,
                    window: policy.window_ms,
                    reset_time: iso8601(decision.reset_at),
                },
            },
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Seconds the caller should wait.
    pub fn retry_after(&self) -> Option<u64> {
        self.header(HEADER_RETRY_AFTER).and_then(|v| v.parse().ok())
    }

    pub fn body_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.body)
    }
}

/// Epoch milliseconds as an ISO 8601 UTC timestamp with millisecond precision.
pub fn iso8601(epoch_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
