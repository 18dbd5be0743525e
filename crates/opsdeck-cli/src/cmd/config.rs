//! `deck config`: show the effective configuration.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use opsdeck_core::config::{SyncConfig, resolve_config, user_config_path};
use serde::Serialize;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Debug, Serialize)]
struct ConfigReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<PathBuf>,
    config: &'a SyncConfig,
}

/// Load the effective config: `--config` file or the user file, then env.
///
/// # Errors
///
/// Returns an error when a config file exists but does not parse.
pub fn load(explicit: Option<&Path>) -> Result<SyncConfig> {
    resolve_config(explicit)
}

fn write_text(report: &ConfigReport<'_>, w: &mut dyn Write) -> io::Result<()> {
    let rendered = toml::to_string(report.config).map_err(io::Error::other)?;
    w.write_all(rendered.as_bytes())
}

fn write_pretty(report: &ConfigReport<'_>, w: &mut dyn Write) -> io::Result<()> {
    let config = report.config;
    pretty_section(w, "Effective configuration")?;
    pretty_kv(
        w,
        "source",
        report
            .source
            .as_ref()
            .map_or_else(|| "(defaults)".to_string(), |path| path.display().to_string()),
    )?;
    pretty_kv(w, "page limit", config.api.page_limit.to_string())?;
    pretty_kv(w, "stale after", format!("{}s", config.cache.stale_after_secs))?;
    pretty_kv(
        w,
        "backoff",
        format!(
            "{}ms → {}ms, jitter {}",
            config.stream.base_delay_ms, config.stream.max_delay_ms, config.stream.jitter
        ),
    )?;
    pretty_kv(
        w,
        "max retries",
        config
            .stream
            .max_retries
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
    )?;
    pretty_kv(w, "resume", config.stream.resume.to_string())?;
    pretty_kv(w, "dedup window", config.stream.dedup_window.to_string())?;
    pretty_kv(w, "log format", &config.log.format)
}

/// # Errors
///
/// Returns an error when output cannot be written.
pub fn run_config(config: &SyncConfig, explicit: Option<&Path>, output: OutputMode) -> Result<()> {
    let source = explicit
        .map(Path::to_path_buf)
        .or_else(user_config_path)
        .filter(|path| path.exists());
    let report = ConfigReport { source, config };
    render_mode(output, &report, write_text, write_pretty)
}
