use serde::Deserialize;

use crate::images::tools::MAX_DIMENSION;
use crate::images::FallbackStrategy;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub address: String,
    /// Request timeout for origin fetches and health probes, in seconds.
    pub timeout: u64,

    pub primary_url_endpoint: String,
    #[serde(default = "default_probe_path")]
    pub primary_probe_path: String,

    pub secondary_endpoint: String,
    pub secondary_bucket: String,
    pub optimizer_url: String,
    /// Origins the optimizer may fetch from. Defaults to the store endpoint.
    pub allowed_source_origins: Option<Vec<String>>,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Byte cap for the optimization cache, 0 disables eviction.
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,

    /// Largest `w`/`h` accepted by the image routes.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    #[serde(default = "default_worker_queue_size")]
    pub worker_queue_size: usize,
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl AppConfig {
    pub fn source_origins(&self) -> Vec<String> {
        match &self.allowed_source_origins {
            Some(origins) if !origins.is_empty() => origins.clone(),
            _ => vec![self.secondary_endpoint.clone()],
        }
    }

    pub fn probe_url(&self) -> String {
        format!(
            "{}/{}",
            self.primary_url_endpoint.trim_end_matches('/'),
            self.primary_probe_path.trim_start_matches('/')
        )
    }
}

fn default_probe_path() -> String {
    "/health-check.png".to_string()
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cache_dir() -> String {
    ".cache/images".to_string()
}

fn default_cache_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_max_dimension() -> u32 {
    MAX_DIMENSION
}

fn default_worker_queue_size() -> usize {
    32
}

fn default_worker_timeout_ms() -> u64 {
    10_000
}

fn default_log_filter() -> String {
    "info".to_string()
}
