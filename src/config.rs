//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/tollgate/config.toml or --config)
//! 3. Built-in defaults (lowest priority)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::events::DEFAULT_SUBSCRIBER_BUFFER;
use crate::pool::pipeline::PipelineConfig;
use crate::pool::PoolConfig;
use crate::store::StoreConfig;
use crate::window::{DEFAULT_BUCKET_MS, DEFAULT_WINDOW_MS};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub bind_addr: SocketAddr,

    /// OpenAI-shaped upstream base URL (`<base>/chat/completions`)
    pub upstream_url: String,

    /// Anthropic-shaped upstream base URL (`<base>/v1/messages`)
    pub anthropic_url: String,

    /// Upstream master credential (ZAI_API_KEY). Requests fail with a
    /// configuration error when absent.
    pub upstream_api_key: Option<String>,

    /// Value for the `anthropic-version` header on Anthropic-shaped calls
    pub anthropic_version: String,

    /// Admin surface credential. The admin API refuses everything when unset.
    pub admin_api_key: Option<String>,

    /// Models tenants may be bound to
    pub allowed_models: Vec<String>,

    /// Connection pooling (DISABLE_CONNECTION_POOL opts out entirely)
    pub pool_enabled: bool,
    pub pool: PoolConfig,

    /// Per-connection pipelining
    pub pipeline: PipelineConfig,

    /// Response cache
    pub cache: CacheConfig,

    /// Tenant storage
    pub store: StoreConfig,

    /// Rolling quota window geometry
    pub window_ms: i64,
    pub bucket_ms: i64,

    /// Per-subscriber event buffer bound
    pub subscriber_buffer: usize,

    /// Streamed-body chunk ceiling (STREAM_REQUEST_CHUNK_SIZE)
    pub stream_chunk_size: usize,

    /// Coalesce small chunks on streamed paths (STREAM_BUFFER_POOL_ENABLED)
    pub stream_buffer_pool: bool,

    /// Per-request timing marks
    pub profiler_enabled: bool,

    /// Log level when RUST_LOG is not set
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8788".parse().expect("default bind addr"),
            upstream_url: "https://api.z.ai/api/coding/paas/v4".to_string(),
            anthropic_url: "https://api.z.ai/api/anthropic".to_string(),
            upstream_api_key: None,
            anthropic_version: "2023-06-01".to_string(),
            admin_api_key: None,
            allowed_models: vec![
                "glm-4.7".to_string(),
                "glm-4.7-air".to_string(),
                "glm-4.6".to_string(),
            ],
            pool_enabled: true,
            pool: PoolConfig::default(),
            pipeline: PipelineConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            window_ms: DEFAULT_WINDOW_MS,
            bucket_ms: DEFAULT_BUCKET_MS,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            stream_chunk_size: 32_768,
            stream_buffer_pool: true,
            profiler_enabled: false,
            log_level: "info".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub upstream_url: Option<String>,
    pub anthropic_url: Option<String>,
    pub anthropic_version: Option<String>,
    pub allowed_models: Option<Vec<String>>,
    pub data_file: Option<String>,
    pub sqlite_path: Option<String>,
    pub log_level: Option<String>,
    pub profiler: Option<bool>,

    /// Optional [pool] section
    pub pool: Option<FilePool>,

    /// Optional [pipeline] section
    pub pipeline: Option<FilePipeline>,

    /// Optional [cache] section
    pub cache: Option<FileCache>,

    /// Optional [events] section
    pub events: Option<FileEvents>,

    /// Optional [window] section
    pub window: Option<FileWindow>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FilePool {
    pub enabled: Option<bool>,
    pub min_connections: Option<usize>,
    pub max_connections: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub keep_alive_timeout_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub enable_http2: Option<bool>,
    pub warm: Option<bool>,
    pub enable_metrics: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FilePipeline {
    pub max_concurrent_per_connection: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub queue_timeout_ms: Option<u64>,
    pub enable_prioritization: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileCache {
    pub enabled: Option<bool>,
    pub max_size: Option<usize>,
    pub default_ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileEvents {
    pub subscriber_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileWindow {
    pub window_duration_ms: Option<i64>,
    pub bucket_size_ms: Option<i64>,
}

impl Config {
    /// Default config file location.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tollgate").join("config.toml"))
    }

    /// Load configuration: defaults, then the TOML file (if present), then
    /// environment variables on top.
    pub fn load(config_path: Option<&std::path::Path>) -> Self {
        let mut config = Config::default();

        let path = config_path
            .map(PathBuf::from)
            .or_else(Self::default_config_path);
        if let Some(path) = path {
            match std::fs::read_to_string(&path) {
                Ok(text) => match toml::from_str::<FileConfig>(&text) {
                    Ok(file) => {
                        config.apply_file(file);
                        tracing::debug!(path = %path.display(), "loaded config file");
                    }
                    Err(e) => {
                        eprintln!("warning: ignoring malformed config {}: {}", path.display(), e);
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    eprintln!("warning: cannot read config {}: {}", path.display(), e);
                }
            }
        }

        config.apply_env();
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(addr) = file.bind_addr.and_then(|s| s.parse().ok()) {
            self.bind_addr = addr;
        }
        if let Some(url) = file.upstream_url {
            self.upstream_url = trim_trailing_slash(&url);
        }
        if let Some(url) = file.anthropic_url {
            self.anthropic_url = trim_trailing_slash(&url);
        }
        if let Some(version) = file.anthropic_version {
            self.anthropic_version = version;
        }
        if let Some(models) = file.allowed_models {
            if !models.is_empty() {
                self.allowed_models = models;
            }
        }
        if let Some(path) = file.data_file {
            self.store.data_file = PathBuf::from(path);
        }
        if let Some(path) = file.sqlite_path {
            self.store.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if let Some(enabled) = file.profiler {
            self.profiler_enabled = enabled;
        }

        if let Some(pool) = file.pool {
            if let Some(v) = pool.enabled {
                self.pool_enabled = v;
            }
            if let Some(v) = pool.min_connections {
                self.pool.min_connections = v;
            }
            if let Some(v) = pool.max_connections {
                self.pool.max_connections = v.max(1);
            }
            if let Some(v) = pool.acquire_timeout_ms {
                self.pool.acquire_timeout = Duration::from_millis(v);
            }
            if let Some(v) = pool.idle_timeout_ms {
                self.pool.idle_timeout = Duration::from_millis(v);
            }
            if let Some(v) = pool.keep_alive_timeout_ms {
                self.pool.keep_alive_timeout = Duration::from_millis(v);
            }
            if let Some(v) = pool.health_check_interval_ms {
                self.pool.health_check_interval = Duration::from_millis(v);
            }
            if let Some(v) = pool.request_timeout_ms {
                self.pool.request_timeout = Duration::from_millis(v);
            }
            if let Some(v) = pool.enable_http2 {
                self.pool.enable_http2 = v;
            }
            if let Some(v) = pool.warm {
                self.pool.warm_pool = v;
            }
            if let Some(v) = pool.enable_metrics {
                self.pool.enable_metrics = v;
            }
        }

        if let Some(pipeline) = file.pipeline {
            if let Some(v) = pipeline.max_concurrent_per_connection {
                self.pipeline.max_concurrent_per_connection = v.max(1);
            }
            if let Some(v) = pipeline.max_queue_size {
                self.pipeline.max_queue_size = v;
            }
            if let Some(v) = pipeline.queue_timeout_ms {
                self.pipeline.queue_timeout = Duration::from_millis(v);
            }
            if let Some(v) = pipeline.enable_prioritization {
                self.pipeline.enable_prioritization = v;
            }
        }

        if let Some(cache) = file.cache {
            if let Some(v) = cache.enabled {
                self.cache.enabled = v;
            }
            if let Some(v) = cache.max_size {
                self.cache.max_size = v;
            }
            if let Some(v) = cache.default_ttl_ms {
                self.cache.default_ttl = Duration::from_millis(v);
            }
        }

        if let Some(events) = file.events {
            if let Some(v) = events.subscriber_buffer {
                self.subscriber_buffer = v.max(1);
            }
        }

        if let Some(window) = file.window {
            if let Some(v) = window.window_duration_ms {
                if v > 0 {
                    self.window_ms = v;
                }
            }
            if let Some(v) = window.bucket_size_ms {
                if v > 0 {
                    self.bucket_ms = v;
                }
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(addr) = env_var("TOLLGATE_BIND").and_then(|s| s.parse().ok()) {
            self.bind_addr = addr;
        }
        if let Some(url) = env_var("TOLLGATE_UPSTREAM_URL") {
            self.upstream_url = trim_trailing_slash(&url);
        }
        if let Some(url) = env_var("TOLLGATE_ANTHROPIC_URL") {
            self.anthropic_url = trim_trailing_slash(&url);
        }
        if let Some(key) = env_var("ZAI_API_KEY") {
            self.upstream_api_key = Some(key);
        }
        if let Some(version) = env_var("ANTHROPIC_VERSION") {
            self.anthropic_version = version;
        }
        if let Some(key) = env_var("ADMIN_API_KEY") {
            self.admin_api_key = Some(key);
        }
        if env_var("DISABLE_CONNECTION_POOL").is_some_and(|v| truthy(&v)) {
            self.pool_enabled = false;
        }
        if let Some(n) = env_var("POOL_MIN_CONNECTIONS").and_then(|s| s.parse().ok()) {
            self.pool.min_connections = n;
        }
        if let Some(n) = env_var("POOL_MAX_CONNECTIONS").and_then(|s| s.parse::<usize>().ok()) {
            self.pool.max_connections = n.max(1);
        }
        if env_var("POOL_WARM").is_some_and(|v| truthy(&v)) {
            self.pool.warm_pool = true;
        }
        if let Some(path) = env_var("DATA_FILE") {
            self.store.data_file = PathBuf::from(path);
        }
        if let Some(path) = env_var("TOLLGATE_DB") {
            self.store.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(n) = env_var("STREAM_REQUEST_CHUNK_SIZE").and_then(|s| s.parse::<usize>().ok())
        {
            self.stream_chunk_size = n.max(1);
        }
        if let Some(v) = env_var("STREAM_BUFFER_POOL_ENABLED") {
            self.stream_buffer_pool = truthy(&v);
        }
        if env_var("TOLLGATE_PROFILER").is_some_and(|v| truthy(&v)) {
            self.profiler_enabled = true;
        }
        if let Some(level) = env_var("TOLLGATE_LOG") {
            self.log_level = level;
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn trim_trailing_slash(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
