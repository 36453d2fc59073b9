//! Configuration management for Gatehouse.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::credentials::DecryptFailurePolicy;
use crate::error::{GatehouseError, Result};
use crate::ratelimit::{BucketStore, PolicySet};

/// Prefix of environment variables that override file settings,
/// e.g. `GATEHOUSE__LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "GATEHOUSE";

/// Main configuration for Gatehouse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatehouseConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitingConfig,

    /// Credentials store configuration
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where token buckets live.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BucketBackend {
    /// Process memory
    #[default]
    Memory,
    /// A Redis server shared by every instance
    Redis {
        url: String,
        #[serde(default = "default_redis_prefix")]
        key_prefix: String,
        #[serde(default = "default_redis_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_idle_ttl_secs")]
        idle_ttl_secs: u64,
    },
}

fn default_redis_prefix() -> String {
    "gatehouse:bucket:".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    250
}

fn default_idle_ttl_secs() -> u64 {
    3600
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// YAML file with limiter policies; replaces `limits` when set
    #[serde(default)]
    pub policies_file: Option<PathBuf>,

    /// Inline limiter policies
    #[serde(default)]
    pub limits: PolicySet,

    /// Keys idle longer than this are dropped by cleanup sweeps
    #[serde(default = "default_cleanup_max_age")]
    pub cleanup_max_age_secs: u64,

    /// Bucket storage for token-bucket policies
    #[serde(default)]
    pub backend: BucketBackend,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policies_file: None,
            limits: PolicySet::default(),
            cleanup_max_age_secs: default_cleanup_max_age(),
            backend: BucketBackend::default(),
        }
    }
}

fn default_cleanup_max_age() -> u64 {
    3600
}

impl RateLimitingConfig {
    /// The policies to enforce, read from `policies_file` if one is set.
    pub fn policy_set(&self) -> Result<PolicySet> {
        match &self.policies_file {
            Some(path) => PolicySet::from_file(path),
            None => {
                self.limits.validate()?;
                Ok(self.limits.clone())
            }
        }
    }

    /// Idle age after which limiter state is swept.
    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_max_age_secs)
    }

    /// Open the configured bucket store. `None` means in-memory buckets.
    pub fn bucket_store(&self) -> Result<Option<Arc<dyn BucketStore>>> {
        match &self.backend {
            BucketBackend::Memory => Ok(None),
            #[cfg(feature = "redis")]
            BucketBackend::Redis {
                url,
                key_prefix,
                timeout_ms,
                idle_ttl_secs,
            } => {
                let store = crate::ratelimit::RedisBucketStore::connect(crate::ratelimit::RedisStoreConfig {
                    url: url.clone(),
                    key_prefix: key_prefix.clone(),
                    timeout: Duration::from_millis(*timeout_ms),
                    idle_ttl: Duration::from_secs(*idle_ttl_secs),
                })?;
                Ok(Some(Arc::new(store)))
            }
            #[cfg(not(feature = "redis"))]
            BucketBackend::Redis { .. } => Err(GatehouseError::Config(
                "redis backend requested but gatehouse was built without the `redis` feature"
                    .to_string(),
            )),
        }
    }
}

/// Credentials store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// File holding the 32-byte encryption key
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Refuse to start instead of falling back to plaintext storage
    #[serde(default)]
    pub require_encryption: bool,

    /// What to return when a stored value cannot be decrypted
    #[serde(default)]
    pub decrypt_failure: DecryptFailurePolicy,

    /// Trim the access log to this many newest entries; unbounded when unset
    #[serde(default)]
    pub max_audit_entries: Option<usize>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            key_path: default_key_path(),
            require_encryption: false,
            decrypt_failure: DecryptFailurePolicy::default(),
            max_audit_entries: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".gatehouse/credentials.db")
}

fn default_key_path() -> PathBuf {
    PathBuf::from(".gatehouse/secret.key")
}

impl GatehouseConfig {
    /// Load configuration from an optional file, overlaid with
    /// `GATEHOUSE__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<GatehouseConfig>())
            .map_err(|e| GatehouseError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GatehouseError::Config(e.to_string()))
    }
}
