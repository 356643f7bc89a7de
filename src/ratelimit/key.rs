//! Throttling key resolution.
//!
//! A key identifies one logical caller. The default scheme is
//! `user:<id>` for authenticated callers and `ip:<address>` otherwise.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Address-candidate headers consulted by the default resolver, in order.
pub const DEFAULT_ADDRESS_HEADERS: &[&str] = &["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

/// Address used when no candidate header carries a value.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Authenticated caller identity, as established by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub role: Option<String>,
    pub tenant_id: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            tenant_id: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Whether the identity carries the given role.
    pub fn has_role(&self, role: &str) -> bool {
        self.role.as_deref() == Some(role)
    }
}

/// Everything the engine knows about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Authenticated identity, if any
    pub identity: Option<Identity>,
    /// Request path
    pub path: String,
    /// Request headers, keyed by lowercase name
    headers: HashMap<String, String>,
}

impl CallerContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            identity: None,
            path: path.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Derives a throttling key from a caller context.
///
/// Implementations must be pure: no I/O, no side effects.
pub trait KeyResolver: Send + Sync {
    /// Resolve the key for this caller.
    fn resolve(&self, ctx: &CallerContext) -> String;

    /// Short label used in logs and the preset listing.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Identity first, then the first address-candidate header with a value.
#[derive(Debug, Clone)]
pub struct DefaultKeyResolver {
    address_headers: Vec<String>,
}

impl DefaultKeyResolver {
    pub fn new() -> Self {
        Self::with_headers(DEFAULT_ADDRESS_HEADERS.iter().map(|h| h.to_string()))
    }

    /// Use a custom ordered list of address-candidate headers.
    pub fn with_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            address_headers: headers
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// The first non-empty candidate address, or `"unknown"`.
    pub fn address<'a>(&self, ctx: &'a CallerContext) -> &'a str {
        self.address_headers
            .iter()
            .filter_map(|name| ctx.header(name))
            // Proxy chains list the client first
            .filter_map(|value| value.split(',').next().map(str::trim))
            .find(|addr| !addr.is_empty())
            .unwrap_or(UNKNOWN_ADDRESS)
    }
}

impl Default for DefaultKeyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyResolver for DefaultKeyResolver {
    fn resolve(&self, ctx: &CallerContext) -> String {
        match &ctx.identity {
            Some(identity) => format!("user:{}", identity.id),
            None => format!("ip:{}", self.address(ctx)),
        }
    }

    fn name(&self) -> &str {
        "default"
    }
}

/// Keys callers by API key header, falling back to the default scheme.
#[derive(Debug, Clone)]
pub struct ApiKeyResolver {
    header: String,
    fallback: DefaultKeyResolver,
}

impl ApiKeyResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            fallback: DefaultKeyResolver::new(),
        }
    }
}

impl KeyResolver for ApiKeyResolver {
    fn resolve(&self, ctx: &CallerContext) -> String {
        match ctx.header(&self.header).map(str::trim) {
            Some(key) if !key.is_empty() => format!("apikey:{}", key),
            _ => self.fallback.resolve(ctx),
        }
    }

    fn name(&self) -> &str {
        "api-key"
    }
}

/// Keys callers by tenant, so a whole tenant shares one quota.
#[derive(Debug, Clone, Default)]
pub struct TenantKeyResolver {
    fallback: DefaultKeyResolver,
}

impl TenantKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyResolver for TenantKeyResolver {
    fn resolve(&self, ctx: &CallerContext) -> String {
        match ctx.identity.as_ref().and_then(|i| i.tenant_id.as_deref()) {
            Some(tenant) => format!("tenant:{}", tenant),
            None => self.fallback.resolve(ctx),
        }
    }

    fn name(&self) -> &str {
        "tenant"
    }
}

/// Adapts a closure into a [`KeyResolver`].
pub struct FnKeyResolver<F> {
    name: String,
    f: F,
}

impl<F> FnKeyResolver<F>
where
    F: Fn(&CallerContext) -> String + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> KeyResolver for FnKeyResolver<F>
where
    F: Fn(&CallerContext) -> String + Send + Sync,
{
    fn resolve(&self, ctx: &CallerContext) -> String {
        (self.f)(ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnKeyResolver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKeyResolver")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a resolver.
pub type SharedKeyResolver = Arc<dyn KeyResolver>;
