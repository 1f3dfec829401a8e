//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `SPELLFLEET_WORKER_NAME` and `SPELLFLEET_LOG_LEVEL` env
//! overrides.

use std::{env, fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::FleetError;

/// Fully-resolved fleet worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Human-readable name for this worker process (log context only).
    pub worker_name: String,
    pub log_level: String,
    /// Response-timeout budget for a single spell invocation. `None` means a
    /// hung spell runner holds its job slot indefinitely — the timeout is the
    /// only backstop, not a cancellation mechanism.
    pub job_timeout: Option<Duration>,
    /// Buffer depth for in-memory fabric queues.
    pub queue_depth: usize,
}

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    worker: RawWorker,
}

#[derive(Deserialize)]
struct RawWorker {
    worker_name: String,
    log_level: String,
    /// Seconds; omit or set to 0 for no budget.
    #[serde(default)]
    job_timeout_seconds: u64,
    #[serde(default = "default_queue_depth")]
    queue_depth: usize,
}

fn default_queue_depth() -> usize {
    64
}

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, FleetError> {
    let name_override = env::var("SPELLFLEET_WORKER_NAME").ok();
    let log_level_override = env::var("SPELLFLEET_LOG_LEVEL").ok();
    load_from(
        Path::new("config/default.toml"),
        name_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    name_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, FleetError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| FleetError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| FleetError::Config(format!("parse error in {}: {e}", path.display())))?;

    let w = parsed.worker;

    let job_timeout = match w.job_timeout_seconds {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Ok(Config {
        worker_name: name_override.unwrap_or(&w.worker_name).to_string(),
        log_level: log_level_override.unwrap_or(&w.log_level).to_string(),
        job_timeout,
        queue_depth: w.queue_depth,
    })
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Safe `Config` for unit tests — no timeout, small queues.
#[cfg(test)]
impl Config {
    pub fn test_default() -> Self {
        Self {
            worker_name: "test".into(),
            log_level: "info".into(),
            job_timeout: None,
            queue_depth: 16,
        }
    }
}
