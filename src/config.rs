use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::sandbox::error::{ConfigError, ConfigResult};
use crate::sandbox::types::{default_limits, Limits, Profile};

// ---------------------------------------------------------------------------
// Docker engine connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    /// `unix:///path` or `tcp://host:port`; `DOCKER_HOST` or the local socket when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_total_retries")]
    pub max_total_retries: u32,
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_total_retries() -> u32 {
    9
}
fn default_max_connect_retries() -> u32 {
    5
}
fn default_max_read_retries() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    200
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_timeout_secs(),
            max_total_retries: default_max_total_retries(),
            max_connect_retries: default_max_connect_retries(),
            max_read_retries: default_max_read_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Working directory inside every container.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_user")]
    pub default_user: String,
    /// Prefix of container and volume names.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Multiplier deriving the wall-clock limit from the CPU limit.
    #[serde(default = "default_cpu_to_realtime_factor")]
    pub cpu_to_realtime_factor: u64,
    /// Cap on each of stdout and stderr in returned results.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Unset fields fall back to the built-in defaults.
    #[serde(default = "default_limits")]
    pub default_limits: Limits,
}

fn default_workdir() -> String {
    "/sandbox".into()
}
fn default_user() -> String {
    "root".into()
}
fn default_name_prefix() -> String {
    "dockjail".into()
}
fn default_cpu_to_realtime_factor() -> u64 {
    5
}
fn default_max_output_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            default_user: default_user(),
            name_prefix: default_name_prefix(),
            cpu_to_realtime_factor: default_cpu_to_realtime_factor(),
            max_output_bytes: default_max_output_bytes(),
            default_limits: default_limits(),
        }
    }
}

// ---------------------------------------------------------------------------
// Log config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text`, `compact` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for daily rolling log files; stderr only when unset.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_true")]
    pub show_target: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
            show_target: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Check values serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for (i, profile) in self.profiles.iter().enumerate() {
            if profile.name.trim().is_empty() {
                return Err(ConfigError::MissingField(format!("profiles[{}].name", i)));
            }
            if profile.docker_image.trim().is_empty() {
                return Err(ConfigError::MissingField(format!("profiles[{}].dockerImage", i)));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate profile name '{}'",
                    profile.name
                )));
            }
        }

        if self.sandbox.cpu_to_realtime_factor < 1 {
            return Err(ConfigError::InvalidValue(
                "sandbox.cpuToRealtimeFactor must be at least 1".to_string(),
            ));
        }
        if self.sandbox.max_output_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "sandbox.maxOutputBytes must be greater than 0".to_string(),
            ));
        }
        if !self.sandbox.workdir.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "sandbox.workdir must be an absolute path, got '{}'",
                self.sandbox.workdir
            )));
        }
        match self.log.format.to_lowercase().as_str() {
            "text" | "compact" | "json" => Ok(()),
            other => Err(ConfigError::InvalidValue(format!("unknown log format '{}'", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths & loading
// ---------------------------------------------------------------------------

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dockjail")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Expand a leading `~` in a configured directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if raw.starts_with('~') {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(raw.trim_start_matches('~').trim_start_matches('/'))
    } else {
        PathBuf::from(raw)
    }
}

/// Load and validate the config; a missing file yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let p = path
        .map(PathBuf::from)
        .unwrap_or_else(config_path);

    let cfg = if p.exists() {
        let text = std::fs::read_to_string(&p)
            .with_context(|| format!("reading config from {}", p.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config from {}", p.display()))?
    } else {
        Config::default()
    };

    cfg.validate()
        .with_context(|| format!("validating config from {}", p.display()))?;
    Ok(cfg)
}
