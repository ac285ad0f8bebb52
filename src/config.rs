//! Configuration loading and types for storeconverge.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs one collaborator: the
//! object-storage API, the account API, retry timing, logging and metrics.
//! Credentials may also come from `STORECONVERGE_*` environment variables,
//! which take precedence over the file.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Object-storage API settings.
    #[serde(default)]
    pub object_storage: ObjectStorageConfig,

    /// Account API settings.
    #[serde(default)]
    pub account_api: AccountApiConfig,

    /// Retry timing.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Object-storage API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStorageConfig {
    /// Backend type: `s3` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// S3-compatible endpoint URL.
    #[serde(default)]
    pub endpoint_url: String,

    /// Signing region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Access key id.  Empty means the S3 client is not configured.
    #[serde(default, alias = "access_key")]
    pub access_key_id: String,

    /// Secret access key.
    #[serde(default, alias = "secret_key")]
    pub secret_access_key: String,

    /// Force path-style URL addressing.
    #[serde(default = "default_true")]
    pub use_path_style: bool,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            endpoint_url: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            use_path_style: true,
        }
    }
}

impl ObjectStorageConfig {
    /// Whether enough is configured to build a client.
    pub fn has_credentials(&self) -> bool {
        self.backend == "memory" || (!self.access_key_id.is_empty() && !self.secret_access_key.is_empty())
    }
}

/// Account API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountApiConfig {
    /// Backend type: `http` or `memory`.
    #[serde(default = "default_account_backend")]
    pub backend: String,

    /// Base URL of the account API.
    #[serde(default = "default_account_url")]
    pub base_url: String,

    #[serde(default)]
    pub account_id: String,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for AccountApiConfig {
    fn default() -> Self {
        Self {
            backend: default_account_backend(),
            base_url: default_account_url(),
            account_id: String::new(),
            access_key: String::new(),
            secret: String::new(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl AccountApiConfig {
    /// Whether enough is configured to build a client.
    pub fn has_credentials(&self) -> bool {
        self.backend == "memory"
            || (!self.account_id.is_empty() && !self.access_key.is_empty() && !self.secret.is_empty())
    }
}

/// Retry timing.  Each reconciler operation has its own deadline.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Deadline for create operations, in seconds.
    #[serde(default = "default_create_timeout")]
    pub create_timeout_seconds: u64,

    /// Deadline for reads, including post-create visibility waits.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// Deadline for updates, including tag propagation waits.
    #[serde(default = "default_update_timeout")]
    pub update_timeout_seconds: u64,

    /// Deadline for deletes.
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_seconds: u64,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Empty-then-delete passes before a forced bucket delete gives up.
    #[serde(default = "default_max_delete_passes")]
    pub max_delete_passes: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            create_timeout_seconds: default_create_timeout(),
            read_timeout_seconds: default_read_timeout(),
            update_timeout_seconds: default_update_timeout(),
            delete_timeout_seconds: default_delete_timeout(),
            min_backoff_ms: default_min_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_delete_passes: default_max_delete_passes(),
        }
    }
}

impl RetryConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_storage_backend() -> String {
    "s3".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_account_backend() -> String {
    "http".to_string()
}

fn default_account_url() -> String {
    "https://api.lyvecloud.seagate.com/v2".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_create_timeout() -> u64 {
    300
}

fn default_read_timeout() -> u64 {
    120
}

fn default_update_timeout() -> u64 {
    120
}

fn default_delete_timeout() -> u64 {
    300
}

fn default_min_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_max_delete_passes() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`, then apply
/// environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config: Config = serde_yaml::from_str(&contents)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Overwrite credentials from `STORECONVERGE_*` variables.  `lookup` is the
/// environment accessor.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let set = |name: &str, target: &mut String| {
        if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
            *target = value;
        }
    };
    set("STORECONVERGE_S3_ENDPOINT", &mut config.object_storage.endpoint_url);
    set("STORECONVERGE_S3_REGION", &mut config.object_storage.region);
    set("STORECONVERGE_S3_ACCESS_KEY", &mut config.object_storage.access_key_id);
    set("STORECONVERGE_S3_SECRET_KEY", &mut config.object_storage.secret_access_key);
    set("STORECONVERGE_ACCOUNT_URL", &mut config.account_api.base_url);
    set("STORECONVERGE_ACCOUNT_ID", &mut config.account_api.account_id);
    set("STORECONVERGE_ACCOUNT_ACCESS_KEY", &mut config.account_api.access_key);
    set("STORECONVERGE_ACCOUNT_SECRET", &mut config.account_api.secret);
}
