use crate::error::GatewayError;
use crate::gateway::GatewaySettings;
use crate::reviews::{Validity, REVIEWS_NAMESPACE};
use crate::server::{AppState, ReviewsRoute};
use gateway_cache::CachePolicy;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable that overrides `[upstream].url`.
pub const ENDPOINT_ENV: &str = "FEATURABLE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reviews: ReviewsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    /// Review widget endpoint. Usually supplied through `FEATURABLE_URL`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size_bytes: usize,
    #[serde(default)]
    pub background_revalidation: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReviewsConfig {
    /// `long`, `short`, `none` or a Cache-Control directive list.
    #[serde(default = "default_cache_strategy")]
    pub cache_strategy: String,
    #[serde(default)]
    pub validity: Validity,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    /// Load `path`, or defaults when there is no such file. A file that exists
    /// but cannot be read or parsed is an error, never a silent fallback.
    pub fn load_or_default(path: &Path) -> Result<Self, GatewayError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(GatewayError::Configuration(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, GatewayError> {
        toml::from_str(contents)
            .map_err(|e| GatewayError::Configuration(format!("invalid config: {e}")))
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENDPOINT_ENV).filter(|u| !u.trim().is_empty()) {
            self.upstream.url = Some(url);
        }
        self
    }

    /// The configured widget endpoint, or a diagnostic naming both ways to set it.
    pub fn endpoint_url(&self) -> Result<&str, GatewayError> {
        let url = self
            .upstream
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                GatewayError::Configuration(format!(
                    "review widget endpoint is not configured: set {ENDPOINT_ENV} or [upstream].url"
                ))
            })?;

        reqwest::Url::parse(url).map_err(|e| {
            GatewayError::Configuration(format!("invalid review widget endpoint {url:?}: {e}"))
        })?;
        Ok(url)
    }

    pub fn cache_policy(&self) -> Result<CachePolicy, GatewayError> {
        CachePolicy::parse(&self.reviews.cache_strategy).ok_or_else(|| {
            GatewayError::Configuration(format!(
                "unknown cache strategy {:?}",
                self.reviews.cache_strategy
            ))
        })
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            namespace: self.cache.namespace.clone(),
            timeout: Duration::from_millis(self.upstream.timeout_ms),
            max_body_size: self.cache.max_body_size_bytes,
            background_revalidation: self.cache.background_revalidation,
        }
    }

    /// Check everything that would otherwise fail on first use.
    pub fn validate(&self) -> Result<(), GatewayError> {
        self.endpoint_url()?;
        self.cache_policy()?;
        if self.cache.capacity == 0 {
            return Err(GatewayError::Configuration(
                "cache capacity must be > 0".into(),
            ));
        }
        if self.cache.namespace.is_empty() {
            return Err(GatewayError::Configuration(
                "cache namespace must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            capacity: default_capacity(),
            max_body_size_bytes: default_max_body_size(),
            background_revalidation: false,
        }
    }
}

impl Default for ReviewsConfig {
    fn default() -> Self {
        Self {
            cache_strategy: default_cache_strategy(),
            validity: Validity::default(),
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - Upstream, strategy, validity or revalidation changed: rebuild the
///   reviews route over the same store (cached entries survive)
/// - Capacity or namespace changed: WARN log, ignore (restart required)
///
/// Returns the config that is now in effect.
pub fn diff_and_apply(old: &Config, new: &Config, state: &Arc<AppState>) -> Config {
    let mut effective = new.clone();

    if old.cache.capacity != new.cache.capacity {
        tracing::warn!(
            old = old.cache.capacity,
            new = new.cache.capacity,
            "capacity change detected, ignoring. Restart to resize the store"
        );
        effective.cache.capacity = old.cache.capacity;
    }

    if old.cache.namespace != new.cache.namespace {
        tracing::warn!(
            old = %old.cache.namespace,
            new = %new.cache.namespace,
            "namespace change detected, ignoring. Restart to move to a new namespace"
        );
        effective.cache.namespace = old.cache.namespace.clone();
    }

    let route_changed = old.upstream != effective.upstream
        || old.reviews != effective.reviews
        || old.cache.max_body_size_bytes != effective.cache.max_body_size_bytes
        || old.cache.background_revalidation != effective.cache.background_revalidation;

    if !route_changed {
        return effective;
    }

    match ReviewsRoute::build(&effective, Arc::clone(&state.store)) {
        Ok(route) => {
            tracing::info!(
                endpoint = %route.client.endpoint(),
                policy = %route.policy,
                validity = ?effective.reviews.validity,
                "config reloaded: reviews route rebuilt"
            );
            state.reviews.store(Arc::new(route));
            effective
        }
        Err(e) => {
            tracing::error!(error = %e, "rejected config reload, keeping previous settings");
            old.clone()
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_namespace() -> String {
    REVIEWS_NAMESPACE.to_string()
}
fn default_capacity() -> usize {
    10000
}
fn default_max_body_size() -> usize {
    1_048_576
}
fn default_cache_strategy() -> String {
    "long".to_string()
}
