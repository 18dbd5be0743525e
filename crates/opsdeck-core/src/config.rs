use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::page::{MAX_PAGE_LIMIT, clamp_limit};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Page size sent with list reads; clamped to the backend's maximum.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl CacheConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_after_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// `None` retries forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,
    #[serde(default = "default_true")]
    pub resume: bool,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// Fixed seed for backoff jitter; used by the simulator.
    #[serde(default)]
    pub jitter_seed: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_retries: default_max_retries(),
            resume: default_true(),
            dedup_window: default_dedup_window(),
            jitter_seed: None,
        }
    }
}

impl StreamConfig {
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: default_log_format(),
        }
    }
}

const fn default_page_limit() -> u32 {
    MAX_PAGE_LIMIT
}

const fn default_stale_after_secs() -> u64 {
    30
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_jitter() -> f64 {
    0.2
}

#[allow(clippy::unnecessary_wraps)]
const fn default_max_retries() -> Option<u32> {
    Some(8)
}

const fn default_true() -> bool {
    true
}

const fn default_dedup_window() -> usize {
    256
}

fn default_log_format() -> String {
    "compact".to_string()
}

/// Load a config file; a missing file yields defaults.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        return Ok(SyncConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<SyncConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(normalize(config))
}

/// Location of the per-user config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("opsdeck/config.toml"))
}

/// Load `<config_dir>/opsdeck/config.toml`.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<SyncConfig> {
    match user_config_path() {
        Some(path) => load_config(&path),
        None => Ok(SyncConfig::default()),
    }
}

/// Resolve the effective config: explicit file (or the user file), then
/// environment overrides.
///
/// # Errors
///
/// Returns an error for unreadable or malformed files and for env overrides
/// that do not parse.
pub fn resolve_config(explicit: Option<&Path>) -> Result<SyncConfig> {
    let config = match explicit {
        Some(path) => load_config(path)?,
        None => load_user_config()?,
    };
    apply_env(config, env::var("OPSDECK_STREAM_MAX_RETRIES").ok())
}

fn apply_env(mut config: SyncConfig, max_retries: Option<String>) -> Result<SyncConfig> {
    if let Some(raw) = max_retries {
        let raw = raw.trim();
        config.stream.max_retries = if raw.eq_ignore_ascii_case("none") || raw == "0" {
            None
        } else {
            Some(
                raw.parse()
                    .with_context(|| format!("OPSDECK_STREAM_MAX_RETRIES is not a number: {raw}"))?,
            )
        };
    }

    Ok(normalize(config))
}

fn normalize(mut config: SyncConfig) -> SyncConfig {
    config.api.page_limit = clamp_limit(config.api.page_limit);
    config.stream.jitter = config.stream.jitter.clamp(0.0, 1.0);
    if config.stream.max_delay_ms < config.stream.base_delay_ms {
        config.stream.max_delay_ms = config.stream.base_delay_ms;
    }
    config
}
