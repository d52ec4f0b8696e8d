//! Gate configuration.
//!
//! Loaded from an optional TOML file; every field has a default, and
//! `IMAGEGATE_*` environment variables override the file.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::warn;

use imagegate_auth::{DecisionTtls, FailPolicy, Permission};
use imagegate_observability::LogFormat;

use crate::authz::{AuthorityClient, AuthorityService, AuthorizationService, BreakerConfig, CircuitBreaker, PermissionCache};
use crate::jobs::{BackoffStrategy, RetryPolicy};
#[cfg(feature = "redis")]
use crate::shared_store::RedisSharedStore;
use crate::shared_store::{InMemorySharedStore, SharedCacheStore};
use crate::submission::PipelineConfig;

const ENV_PREFIX: &str = "IMAGEGATE_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub authority: AuthoritySettings,
    pub cache: CacheSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub staging: StagingSettings,
    /// Shared store for the cache and breaker; in-memory when unset.
    pub redis_url: Option<String>,
    pub required_permission: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthoritySettings {
    pub url: String,
    pub timeout_ms: u64,
    pub fail_policy: FailPolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub read_ttl_secs: u64,
    pub write_ttl_secs: u64,
    pub admin_ttl_secs: u64,
    pub denied_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub timeout_secs: u64,
    pub key_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    pub jitter: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StagingSettings {
    pub bucket: String,
    /// Age after which staging blobs of failed/pending jobs are swept.
    pub sweep_max_age_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            authority: AuthoritySettings::default(),
            cache: CacheSettings::default(),
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            staging: StagingSettings::default(),
            redis_url: None,
            required_permission: Permission::IMAGE_UPLOAD.as_str().to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            timeout_ms: 2_000,
            fail_policy: FailPolicy::FailClosed,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        let ttls = DecisionTtls::default();
        Self {
            enabled: true,
            read_ttl_secs: ttls.read.as_secs(),
            write_ttl_secs: ttls.write.as_secs(),
            admin_ttl_secs: ttls.admin.as_secs(),
            denied_ttl_secs: ttls.denied.as_secs(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let breaker = BreakerConfig::default();
        Self {
            threshold: breaker.threshold,
            timeout_secs: breaker.timeout.as_secs(),
            key_prefix: breaker.key_prefix,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            strategy: policy.strategy,
            jitter: policy.jitter,
        }
    }
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            bucket: "images".to_string(),
            sweep_max_age_secs: 24 * 3600,
        }
    }
}

impl GateConfig {
    /// Load `path` (if it exists), then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml_str(&contents).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_with(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `IMAGEGATE_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| -> Option<(String, String)> {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).filter(|v| !v.is_empty()).map(|v| (name, v))
        };

        if let Some((_, v)) = var("AUTHORITY_URL") {
            self.authority.url = v;
        }
        if let Some((n, v)) = var("AUTHORITY_TIMEOUT_MS") {
            self.authority.timeout_ms = parse(&n, &v)?;
        }
        if let Some((n, v)) = var("FAIL_POLICY") {
            self.authority.fail_policy = match v.as_str() {
                "fail_closed" | "closed" => FailPolicy::FailClosed,
                "fail_open" | "open" => FailPolicy::FailOpen,
                other => bail!("{n}: unknown fail policy '{other}'"),
            };
        }
        if let Some((n, v)) = var("CACHE_ENABLED") {
            self.cache.enabled = parse(&n, &v.to_ascii_lowercase())?;
        }
        if let Some((n, v)) = var("CACHE_READ_TTL_SECS") {
            self.cache.read_ttl_secs = parse(&n, &v)?;
        }
        if let Some((n, v)) = var("CACHE_WRITE_TTL_SECS") {
            self.cache.write_ttl_secs = parse(&n, &v)?;
        }
        if let Some((n, v)) = var("CACHE_ADMIN_TTL_SECS") {
            self.cache.admin_ttl_secs = parse(&n, &v)?;
        }
        if let Some((n, v)) = var("CACHE_DENIED_TTL_SECS") {
            self.cache.denied_ttl_secs = parse(&n, &v)?;
        }
        if let Some((n, v)) = var("BREAKER_THRESHOLD") {
            self.breaker.threshold = parse(&n, &v)?;
        }
        if let Some((n, v)) = var("BREAKER_TIMEOUT_SECS") {
            self.breaker.timeout_secs = parse(&n, &v)?;
        }
        if let Some((_, v)) = var("BREAKER_KEY_PREFIX") {
            self.breaker.key_prefix = v;
        }
        if let Some((n, v)) = var("MAX_RETRIES") {
            self.retry.max_retries = parse(&n, &v)?;
        }
        if let Some((_, v)) = var("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some((_, v)) = var("BUCKET") {
            self.staging.bucket = v;
        }
        if let Some((n, v)) = var("STAGING_MAX_AGE_SECS") {
            self.staging.sweep_max_age_secs = parse(&n, &v)?;
        }
        if let Some((_, v)) = var("REQUIRED_PERMISSION") {
            self.required_permission = v;
        }
        if let Some((n, v)) = var("LOG_FORMAT") {
            self.log_format = parse(&n, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let ttls = [
            ("cache.read_ttl_secs", self.cache.read_ttl_secs),
            ("cache.write_ttl_secs", self.cache.write_ttl_secs),
            ("cache.admin_ttl_secs", self.cache.admin_ttl_secs),
            ("cache.denied_ttl_secs", self.cache.denied_ttl_secs),
        ];
        if let Some((name, _)) = ttls.iter().find(|(_, secs)| *secs == 0) {
            bail!("{name} must be positive");
        }
        if self.breaker.threshold == 0 {
            bail!("breaker.threshold must be at least 1");
        }
        if self.authority.timeout_ms == 0 {
            bail!("authority.timeout_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be within 0.0..=1.0");
        }
        if self.required_permission.trim().is_empty() {
            bail!("required_permission must not be empty");
        }
        Ok(())
    }

    pub fn authority_timeout(&self) -> Duration {
        Duration::from_millis(self.authority.timeout_ms)
    }

    pub fn ttls(&self) -> DecisionTtls {
        DecisionTtls {
            read: Duration::from_secs(self.cache.read_ttl_secs),
            write: Duration::from_secs(self.cache.write_ttl_secs),
            admin: Duration::from_secs(self.cache.admin_ttl_secs),
            denied: Duration::from_secs(self.cache.denied_ttl_secs),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker.threshold,
            timeout: Duration::from_secs(self.breaker.timeout_secs),
            key_prefix: self.breaker.key_prefix.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            strategy: self.retry.strategy,
            jitter: self.retry.jitter,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            bucket: self.staging.bucket.clone(),
            required_permission: Permission::new(self.required_permission.clone()),
            max_retries: self.retry.max_retries,
        }
    }

    pub fn staging_max_age(&self) -> Duration {
        Duration::from_secs(self.staging.sweep_max_age_secs)
    }

    /// Store named by `redis_url`, or a process-local one when unset.
    pub async fn shared_store(&self) -> Result<Arc<dyn SharedCacheStore>> {
        match self.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(url) => {
                let store = RedisSharedStore::connect(url)
                    .await
                    .context("connecting to the shared redis store")?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => bail!("redis_url is set but imagegate-infra was built without the `redis` feature"),
            None => {
                warn!("no redis_url configured; cache and breaker state stay local to this process");
                Ok(InMemorySharedStore::arc())
            }
        }
    }

    /// Wire cache, breaker and client around `store` and `authority`.
    pub fn authorization_service(
        &self,
        store: Arc<dyn SharedCacheStore>,
        authority: Arc<dyn AuthorityService>,
    ) -> AuthorizationService {
        let cache = PermissionCache::new(store.clone(), self.ttls()).enabled(self.cache.enabled);
        let breaker = CircuitBreaker::new("authority", store, self.breaker());
        let client = AuthorityClient::new(authority, Arc::new(breaker), self.authority_timeout());
        AuthorizationService::new(Arc::new(cache), client, self.authority.fail_policy)
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("{name}: invalid value '{value}'"))
}
