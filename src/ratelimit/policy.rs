//! Throttling policies and the named preset registry.
//!
//! A [`Policy`] carries the limits, the window strategy, the key resolver
//! and the response behavior for one class of endpoints. The
//! [`PolicyRegistry`] holds the built-in presets plus any registered
//! policies, and merges partial [`PolicyOverrides`] onto them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::key::{
    ApiKeyResolver, CallerContext, DefaultKeyResolver, SharedKeyResolver, TenantKeyResolver,
};
use super::strategy::{Algorithm, DEFAULT_SLIDING_PRECISION};
use crate::error::{FloodgateError, Result};

/// Preset for login and token endpoints.
pub const AUTH: &str = "auth";
/// Preset for general authenticated API traffic; also the fallback.
pub const API: &str = "api";
/// Preset for anonymous endpoints.
pub const PUBLIC: &str = "public";
/// Preset for file uploads.
pub const UPLOAD: &str = "upload";
/// Preset for password reset requests.
pub const PASSWORD_RESET: &str = "passwordReset";
/// Preset for account registration.
pub const REGISTRATION: &str = "registration";

/// Role whose callers bypass the `api` preset.
pub const PRIVILEGED_ROLE: &str = "admin";

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";
const DEFAULT_STATUS_CODE: u16 = 429;

/// Predicate deciding whether a request bypasses throttling entirely.
pub type SkipPredicate = Arc<dyn Fn(&CallerContext) -> bool + Send + Sync>;

/// Configuration of limits and behavior for a class of endpoints.
#[derive(Clone)]
pub struct Policy {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Window strategy
    pub algorithm: Algorithm,
    /// Sub-window buckets per window (sliding window only)
    pub sliding_precision: u32,
    /// Derives the throttling key from the caller
    pub key_resolver: SharedKeyResolver,
    /// Requests matching this predicate are never throttled
    pub skip: Option<SkipPredicate>,
    /// Message returned in the denial body
    pub message: String,
    /// Status code of the denial response
    pub status_code: u16,
    /// Whether to attach `X-RateLimit-*` headers
    pub emit_headers: bool,
    /// Give quota back when the downstream response status is below 400
    pub skip_successful: bool,
    /// Do not count requests that were denied
    pub skip_failed: bool,
}

impl Policy {
    /// A fixed-window policy with default behavior.
    pub fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            algorithm: Algorithm::FixedWindow,
            sliding_precision: DEFAULT_SLIDING_PRECISION,
            key_resolver: Arc::new(DefaultKeyResolver::new()),
            skip: None,
            message: DEFAULT_MESSAGE.to_string(),
            status_code: DEFAULT_STATUS_CODE,
            emit_headers: true,
            skip_successful: false,
            skip_failed: false,
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_sliding_precision(mut self, precision: u32) -> Self {
        self.sliding_precision = precision;
        self
    }

    pub fn with_key_resolver(mut self, resolver: SharedKeyResolver) -> Self {
        self.key_resolver = resolver;
        self
    }

    pub fn with_skip<F>(self, predicate: F) -> Self
    where
        F: Fn(&CallerContext) -> bool + Send + Sync + 'static,
    {
        self.with_skip_predicate(Arc::new(predicate))
    }

    pub fn with_skip_predicate(mut self, predicate: SkipPredicate) -> Self {
        self.skip = Some(predicate);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_emit_headers(mut self, emit: bool) -> Self {
        self.emit_headers = emit;
        self
    }

    pub fn with_skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful = skip;
        self
    }

    pub fn with_skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed = skip;
        self
    }

    /// Whether this request bypasses throttling.
    pub fn should_skip(&self, ctx: &CallerContext) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(ctx))
    }

    /// Check the policy can be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(FloodgateError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(FloodgateError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if self.algorithm == Algorithm::SlidingWindow && self.sliding_precision == 0 {
            return Err(FloodgateError::Config(
                "sliding_precision must be greater than zero".to_string(),
            ));
        }
        if !(400..=599).contains(&self.status_code) {
            return Err(FloodgateError::Config(format!(
                "status_code {} is not an error status",
                self.status_code
            )));
        }
        Ok(())
    }

    /// Copy of this policy with the provided override fields applied.
    pub fn merge(&self, overrides: &PolicyOverrides) -> Policy {
        let mut policy = self.clone();
        if let Some(window_ms) = overrides.window_ms {
            policy.window_ms = window_ms;
        }
        if let Some(max_requests) = overrides.max_requests {
            policy.max_requests = max_requests;
        }
        if let Some(algorithm) = overrides.algorithm {
            policy.algorithm = algorithm;
        }
        if let Some(precision) = overrides.sliding_precision {
            policy.sliding_precision = precision;
        }
        if let Some(ref key_by) = overrides.key_by {
            policy.key_resolver = key_by.resolver();
        }
        if let Some(ref roles) = overrides.bypass_roles {
            policy.skip = Some(bypass_roles(roles.clone()));
        }
        if let Some(ref message) = overrides.message {
            policy.message = message.clone();
        }
        if let Some(status_code) = overrides.status_code {
            policy.status_code = status_code;
        }
        if let Some(emit) = overrides.emit_headers {
            policy.emit_headers = emit;
        }
        if let Some(skip) = overrides.skip_successful {
            policy.skip_successful = skip;
        }
        if let Some(skip) = overrides.skip_failed {
            policy.skip_failed = skip;
        }
        policy
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("algorithm", &self.algorithm)
            .field("sliding_precision", &self.sliding_precision)
            .field("key_resolver", &self.key_resolver.name())
            .field("skip", &self.skip.is_some())
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .field("emit_headers", &self.emit_headers)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .finish()
    }
}

/// Skip predicate matching identities that carry one of `roles`.
pub fn bypass_roles(roles: Vec<String>) -> SkipPredicate {
    Arc::new(move |ctx: &CallerContext| {
        ctx.identity
            .as_ref()
            .is_some_and(|identity| roles.iter().any(|role| identity.has_role(role)))
    })
}

/// Key scheme selectable from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum KeyScheme {
    /// `user:<id>` or `ip:<address>`
    Default {
        #[serde(default)]
        address_headers: Option<Vec<String>>,
    },
    /// `apikey:<value>` from the named header
    ApiKey { header: String },
    /// `tenant:<id>` from the identity
    Tenant,
}

impl KeyScheme {
    pub fn resolver(&self) -> SharedKeyResolver {
        match self {
            KeyScheme::Default {
                address_headers: Some(headers),
            } => Arc::new(DefaultKeyResolver::with_headers(headers.iter().cloned())),
            KeyScheme::Default {
                address_headers: None,
            } => Arc::new(DefaultKeyResolver::new()),
            KeyScheme::ApiKey { header } => Arc::new(ApiKeyResolver::new(header.clone())),
            KeyScheme::Tenant => Arc::new(TenantKeyResolver::new()),
        }
    }
}

/// Partial policy: only the provided fields replace the base policy's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    /// Preset this policy inherits from (configuration only)
    pub preset: Option<String>,
    pub window_ms: Option<u64>,
    pub max_requests: Option<u64>,
    pub algorithm: Option<Algorithm>,
    pub sliding_precision: Option<u32>,
    pub key_by: Option<KeyScheme>,
    /// Identities with any of these roles bypass throttling
    pub bypass_roles: Option<Vec<String>>,
    pub message: Option<String>,
    pub status_code: Option<u16>,
    pub emit_headers: Option<bool>,
    pub skip_successful: Option<bool>,
    pub skip_failed: Option<bool>,
}

/// Named policies, starting from the built-in presets.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Policy>,
}

impl PolicyRegistry {
    /// Registry with the built-in presets and the default key resolver.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(DefaultKeyResolver::new()))
    }

    /// Registry whose presets key callers with `resolver`.
    pub fn with_resolver(resolver: SharedKeyResolver) -> Self {
        let presets = [
            (
                AUTH,
                Policy::new(5, 15 * MINUTE_MS)
                    .with_message("Too many authentication attempts, please try again later.")
                    .with_skip_successful(true),
            ),
            (
                API,
                Policy::new(10_000, MINUTE_MS)
                    .with_skip_predicate(bypass_roles(vec![PRIVILEGED_ROLE.to_string()])),
            ),
            (
                PUBLIC,
                Policy::new(20, MINUTE_MS)
                    .with_message("Too many requests from this address, please try again later."),
            ),
            (
                UPLOAD,
                Policy::new(10, 5 * MINUTE_MS)
                    .with_message("Too many uploads, please try again later."),
            ),
            (
                PASSWORD_RESET,
                Policy::new(3, HOUR_MS)
                    .with_message("Too many password reset attempts, please try again later."),
            ),
            (
                REGISTRATION,
                Policy::new(5, HOUR_MS)
                    .with_message("Too many accounts created, please try again later."),
            ),
        ];

        let policies = presets
            .into_iter()
            .map(|(name, policy)| (name.to_string(), policy.with_key_resolver(resolver.clone())))
            .collect();

        Self { policies }
    }

    /// Add or replace a named policy after validating it.
    pub fn register(&mut self, name: impl Into<String>, policy: Policy) -> Result<()> {
        let name = name.into();
        policy
            .validate()
            .map_err(|e| FloodgateError::Config(format!("policy '{}': {}", name, e)))?;

        debug!(
            policy = %name,
            limit = policy.max_requests,
            window_ms = policy.window_ms,
            algorithm = %policy.algorithm,
            "Registered rate limit policy"
        );
        self.policies.insert(name, policy);
        Ok(())
    }

    /// Look up a policy; unknown names fall back to [`API`].
    pub fn get(&self, name: &str) -> &Policy {
        match self.policies.get(name) {
            Some(policy) => policy,
            // Presets are never removed, only replaced
            None => &self.policies[API],
        }
    }

    /// Whether a policy with this exact name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// The named policy with `overrides` merged on top.
    pub fn resolve(&self, name: &str, overrides: &PolicyOverrides) -> Result<Policy> {
        let policy = self.get(name).merge(overrides);
        policy
            .validate()
            .map_err(|e| FloodgateError::Config(format!("policy '{}': {}", name, e)))?;
        Ok(policy)
    }

    /// Register every configured policy, each inheriting from its preset.
    ///
    /// A configured name without an explicit `preset` inherits from the
    /// policy of the same name, so `auth: {max_requests: 10}` tightens the
    /// built-in `auth` preset in place.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, PolicyOverrides>) -> Result<()> {
        let mut names: Vec<&String> = overrides.keys().collect();
        names.sort();

        for name in names {
            let entry = &overrides[name];
            let base = entry.preset.as_deref().unwrap_or(name);
            let policy = self.resolve(base, entry)?;
            self.register(name.clone(), policy)?;
        }

        info!(count = overrides.len(), "Applied configured rate limit policies");
        Ok(())
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered policies, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Policy)> {
        self.names()
            .into_iter()
            .filter_map(move |name| self.policies.get(name).map(|p| (name, p)))
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
