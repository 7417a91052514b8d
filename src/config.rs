//! Configuration loading and types for meshbucket.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, authentication, the location index, placement,
//! and the set of physical backends behind the virtual bucket.

use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::cluster::placement::PlacementStrategy;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    #[garde(dive)]
    pub server: ServerConfig,

    /// Virtual credential and signature settings.
    #[serde(default)]
    #[garde(dive)]
    pub auth: AuthConfig,

    /// Physical backends, in registration order.
    #[serde(default)]
    #[garde(length(min = 1), dive)]
    pub backends: Vec<BackendDescriptor>,

    /// Location index store settings.
    #[serde(default)]
    #[garde(dive)]
    pub index: IndexConfig,

    /// Upload placement policy.
    #[serde(default)]
    #[garde(dive)]
    pub placement: PlacementConfig,

    /// Rebuild and background work settings.
    #[serde(default)]
    #[garde(dive)]
    pub cluster: ClusterConfig,

    /// Edge content cache for small GET responses.
    #[serde(default)]
    #[garde(skip)]
    pub edge_cache: EdgeCacheConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(dive)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics endpoint).
    #[serde(default)]
    #[garde(skip)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    #[garde(length(min = 1))]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    #[garde(skip)]
    pub port: u16,

    /// Name of the virtual bucket presented in listings.
    #[serde(default = "default_bucket_name")]
    #[garde(length(min = 1))]
    pub bucket_name: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    #[garde(skip)]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bucket_name: default_bucket_name(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Authentication settings for the single virtual credential.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuthConfig {
    /// Access key clients must present.
    #[serde(alias = "access_key_id", default = "default_access_key")]
    #[garde(length(min = 1))]
    pub access_key: String,

    /// Secret key. An empty secret switches to key-only checking.
    #[serde(alias = "secret_access_key", default = "default_secret_key")]
    #[garde(skip)]
    pub secret_key: String,

    /// Value of the `token` query parameter that skips signature checks.
    #[serde(default)]
    #[garde(skip)]
    pub bypass_token: Option<String>,

    /// Allowed distance between `x-amz-date` and the server clock (0 disables).
    #[serde(default = "default_max_clock_skew")]
    #[garde(skip)]
    pub max_clock_skew_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            bypass_token: None,
            max_clock_skew_secs: default_max_clock_skew(),
        }
    }
}

/// What kind of endpoint a backend descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A real S3-compatible endpoint reached over HTTP.
    #[default]
    S3,
    /// An in-process store (local demos and tests).
    Memory,
}

/// How a backend is enumerated during an index rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingMode {
    /// `GET /?list-type=2` with continuation tokens.
    #[default]
    V2,
    /// `GET /?versions` with key / version-id markers.
    Versions,
}

/// One physical backend.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BackendDescriptor {
    /// Unique name, used as the placement target and in `X-Served-By`.
    #[garde(length(min = 1), pattern(r"^[A-Za-z0-9._-]+$"))]
    pub name: String,

    #[serde(default)]
    #[garde(skip)]
    pub kind: BackendKind,

    #[serde(default)]
    #[garde(skip)]
    pub access_key_id: String,

    #[serde(default)]
    #[garde(skip)]
    pub secret_access_key: String,

    /// Host, optionally `host:port`.
    #[serde(default)]
    #[garde(skip)]
    pub endpoint: String,

    #[serde(default = "default_region")]
    #[garde(length(min = 1))]
    pub region: String,

    /// Bucket for path-style addressing. When unset the endpoint itself
    /// is treated as the bucket root.
    #[serde(default)]
    #[garde(skip)]
    pub bucket: Option<String>,

    #[serde(default = "default_scheme")]
    #[garde(pattern(r"^https?$"))]
    pub scheme: String,

    #[serde(default)]
    #[garde(skip)]
    pub listing: ListingMode,

    /// Whether the backend retains hidden versions after overwrite/delete.
    #[serde(default)]
    #[garde(skip)]
    pub versioned: bool,

    /// Per-backend ceiling overriding `placement.capacity_bytes`.
    #[serde(default)]
    #[garde(range(min = 1))]
    pub capacity_bytes: Option<u64>,
}

impl BackendDescriptor {
    /// Descriptor for an in-process backend with default settings.
    pub fn memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: BackendKind::Memory,
            access_key_id: String::new(),
            secret_access_key: String::new(),
            endpoint: String::new(),
            region: default_region(),
            bucket: None,
            scheme: default_scheme(),
            listing: ListingMode::V2,
            versioned: false,
            capacity_bytes: None,
        }
    }
}

/// Location index store configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct IndexConfig {
    /// Store type: `sqlite` or `memory`.
    #[serde(default = "default_index_engine")]
    #[garde(pattern(r"^(sqlite|memory)$"))]
    pub engine: String,

    /// Path to the SQLite database file.
    #[serde(default = "default_index_path")]
    #[garde(length(min = 1))]
    pub path: String,

    /// Seconds a rebuilt index stays authoritative.
    #[serde(default = "default_index_ttl")]
    #[garde(range(min = 1))]
    pub ttl_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            engine: default_index_engine(),
            path: default_index_path(),
            ttl_secs: default_index_ttl(),
        }
    }
}

/// Upload placement settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlacementConfig {
    #[serde(default)]
    #[garde(skip)]
    pub strategy: PlacementStrategy,

    /// Default per-backend ceiling in bytes.
    #[serde(default = "default_capacity")]
    #[garde(range(min = 1))]
    pub capacity_bytes: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: PlacementStrategy::default(),
            capacity_bytes: default_capacity(),
        }
    }
}

/// Rebuild and deferred work settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ClusterConfig {
    /// Extra attempts per backend when a listing page fails.
    #[serde(default = "default_rebuild_retries")]
    #[garde(range(max = 10))]
    pub rebuild_retries: u32,

    /// Maximum number of background tasks running at once.
    #[serde(default = "default_background_workers")]
    #[garde(range(min = 1))]
    pub background_workers: usize,

    /// Timeout applied to every backend HTTP request, in seconds.
    #[serde(default = "default_backend_timeout")]
    #[garde(range(min = 1))]
    pub backend_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rebuild_retries: default_rebuild_retries(),
            background_workers: default_background_workers(),
            backend_timeout_secs: default_backend_timeout(),
        }
    }
}

/// Edge content cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeCacheConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    /// Responses larger than this are never cached.
    #[serde(default = "default_cache_entry_bytes")]
    pub max_entry_bytes: u64,
}

impl Default for EdgeCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: default_cache_entries(),
            max_entry_bytes: default_cache_entry_bytes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    #[garde(length(min = 1))]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    #[garde(pattern(r"^(text|json)$"))]
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
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9012
}

fn default_bucket_name() -> String {
    "meshbucket".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_access_key() -> String {
    "meshbucket".to_string()
}

fn default_secret_key() -> String {
    "meshbucket-secret".to_string()
}

fn default_max_clock_skew() -> u64 {
    900
}

fn default_index_engine() -> String {
    "sqlite".to_string()
}

fn default_index_path() -> String {
    "./data/index.db".to_string()
}

fn default_index_ttl() -> u64 {
    86_400
}

fn default_capacity() -> u64 {
    10_737_418_240 // 10 GiB
}

fn default_rebuild_retries() -> u32 {
    2
}

fn default_background_workers() -> usize {
    8
}

fn default_backend_timeout() -> u64 {
    300
}

fn default_cache_entries() -> usize {
    1024
}

fn default_cache_entry_bytes() -> u64 {
    1_048_576
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    config
        .validate()
        .map_err(|report| anyhow::anyhow!("invalid configuration: {report}"))?;
    check_backends(&config.backends)?;
    Ok(config)
}

/// Cross-field checks garde cannot express per field.
fn check_backends(backends: &[BackendDescriptor]) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for backend in backends {
        if !seen.insert(backend.name.as_str()) {
            anyhow::bail!("duplicate backend name: {}", backend.name);
        }
        if backend.kind == BackendKind::S3 {
            if backend.endpoint.is_empty() {
                anyhow::bail!("backend {} has no endpoint", backend.name);
            }
            if backend.access_key_id.is_empty() || backend.secret_access_key.is_empty() {
                anyhow::bail!("backend {} is missing credentials", backend.name);
            }
            if backend.versioned && backend.listing == ListingMode::V2 {
                anyhow::bail!(
                    "backend {} is versioned but uses listing: v2, which reports no version ids; set listing: versions",
                    backend.name
                );
            }
        }
    }
    Ok(())
}
