//! Configuration management for Floodgate.
//!
//! Configuration comes from an optional YAML file, with store and key
//! resolver settings overridable through `FLOODGATE__*` environment
//! variables (`FLOODGATE__STORE__REDIS_URL`, `FLOODGATE__STORE__KEY_PREFIX`,
//! ...).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{
    DefaultKeyResolver, PolicyOverrides, PolicyRegistry, DEFAULT_ADDRESS_HEADERS,
};
use crate::store::{LocalStore, TieredStore, DEFAULT_KEY_PREFIX, DEFAULT_SWEEP_PROBABILITY};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the throttling engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Default key resolution
    #[serde(default)]
    pub key_resolver: KeyResolverConfig,

    /// Named policy overrides, merged onto the presets
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverrides>,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL of the shared remote store; local-only when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single remote operation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Fraction of local reads that sweep expired entries
    #[serde(default = "default_sweep_probability")]
    pub local_sweep_probability: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            local_sweep_probability: default_sweep_probability(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_sweep_probability() -> f64 {
    DEFAULT_SWEEP_PROBABILITY
}

/// Key resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResolverConfig {
    /// Headers checked, in order, for the caller address
    #[serde(default = "default_address_headers")]
    pub address_headers: Vec<String>,
}

impl Default for KeyResolverConfig {
    fn default() -> Self {
        Self {
            address_headers: default_address_headers(),
        }
    }
}

fn default_address_headers() -> Vec<String> {
    DEFAULT_ADDRESS_HEADERS.iter().map(|h| h.to_string()).collect()
}

impl FloodgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))
    }

    /// Load an optional file, then apply `FLOODGATE__*` environment overrides.
    ///
    /// Only scalar settings are taken from the environment. Policy names are
    /// case-sensitive (`passwordReset`), so policies come from the file alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        let env = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| FloodgateError::Config(e.to_string()))?;

        if let Ok(url) = env.get_string("store.redis_url") {
            self.store.redis_url = Some(url);
        }
        if let Ok(prefix) = env.get_string("store.key_prefix") {
            self.store.key_prefix = prefix;
        }
        if let Ok(timeout) = env.get_int("store.operation_timeout_ms") {
            self.store.operation_timeout_ms = u64::try_from(timeout).map_err(|_| {
                FloodgateError::Config(format!("operation_timeout_ms {} is negative", timeout))
            })?;
        }
        if let Ok(probability) = env.get_float("store.local_sweep_probability") {
            self.store.local_sweep_probability = probability;
        }
        if let Ok(headers) = env.get_string("key_resolver.address_headers") {
            self.key_resolver.address_headers = headers
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    /// Policy registry with the presets keyed by the configured resolver
    /// and every configured override applied.
    pub fn registry(&self) -> Result<PolicyRegistry> {
        let resolver =
            DefaultKeyResolver::with_headers(self.key_resolver.address_headers.iter().cloned());
        let mut registry = PolicyRegistry::with_resolver(Arc::new(resolver));
        registry.apply_overrides(&self.policies)?;
        Ok(registry)
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Build the tiered store this configuration describes.
    ///
    /// An unreachable remote does not fail startup: the store comes up
    /// local-only and the failure is logged.
    pub async fn build(&self, clock: Arc<dyn Clock>) -> Result<TieredStore> {
        if !(0.0..=1.0).contains(&self.local_sweep_probability) {
            return Err(FloodgateError::Config(format!(
                "local_sweep_probability {} is not within 0..=1",
                self.local_sweep_probability
            )));
        }

        let local = Arc::new(LocalStore::with_sweep_probability(
            clock,
            self.local_sweep_probability,
        ));

        let store = match self.redis_url.as_deref() {
            Some(url) => self.connect_remote(url, local).await,
            None => TieredStore::local_only(local),
        };
        Ok(store.with_key_prefix(self.key_prefix.clone()))
    }

    #[cfg(feature = "redis")]
    async fn connect_remote(&self, url: &str, local: Arc<LocalStore>) -> TieredStore {
        match crate::store::RedisStore::connect(url, self.operation_timeout()).await {
            Ok(remote) => TieredStore::new(Arc::new(remote), local),
            Err(e) => {
                warn!(error = %e, "Remote state store unreachable, starting local-only");
                TieredStore::local_only(local)
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_remote(&self, _url: &str, local: Arc<LocalStore>) -> TieredStore {
        warn!("Built without the redis feature, ignoring redis_url");
        TieredStore::local_only(local)
    }
}
