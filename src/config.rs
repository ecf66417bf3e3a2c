#![forbid(unsafe_code)]

//! Runtime configuration shared by the backend and the maintenance CLI.
//!
//! Values are resolved in this order: explicit overrides (CLI flags), process
//! environment, then the `.env` file.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_NEWTUBE_PORT: u16 = 8080;
pub const DEFAULT_NEWTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_FEED_TTL_SECS: u64 = 10 * 60;
pub const DEFAULT_METADATA_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_FALLBACK_MAX_AGE_DAYS: u64 = 7;
pub const DEFAULT_CLEANUP_PROBABILITY: f64 = 0.01;

pub const CACHE_FILE: &str = "cache.json";
pub const FALLBACK_DIR: &str = "fallback";
pub const UPLOADS_FILE: &str = "uploads.json";
pub const PRESETS_FILE: &str = "presets.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" | "plain" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub data_root: PathBuf,
    pub newtube_port: u16,
    pub newtube_host: String,
    pub upstream_url: Option<String>,
    pub upstream_key: Option<String>,
    pub feed_ttl: Duration,
    pub metadata_ttl: Duration,
    pub fallback_max_age: Duration,
    pub cleanup_probability: f64,
    pub log_format: LogFormat,
}

impl RuntimeSettings {
    pub fn cache_file(&self) -> PathBuf {
        self.data_root.join(CACHE_FILE)
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.data_root.join(FALLBACK_DIR)
    }

    pub fn uploads_file(&self) -> PathBuf {
        self.data_root.join(UPLOADS_FILE)
    }

    pub fn presets_file(&self) -> PathBuf {
        self.data_root.join(PRESETS_FILE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub newtube_port: Option<u16>,
    pub newtube_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup("NEWTUBE_DATA_ROOT"))
        .ok_or_else(|| anyhow!("NEWTUBE_DATA_ROOT not set"))?;
    let newtube_port = overrides
        .newtube_port
        .or_else(|| lookup("NEWTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_NEWTUBE_PORT);
    let newtube_host = overrides
        .newtube_host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("NEWTUBE_HOST"))
        .unwrap_or_else(|| DEFAULT_NEWTUBE_HOST.to_string());
    let cleanup_probability = lookup("NEWTUBE_CLEANUP_PROBABILITY")
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| (0.0..=1.0).contains(value))
        .unwrap_or(DEFAULT_CLEANUP_PROBABILITY);
    let log_format = lookup("NEWTUBE_LOG_FORMAT")
        .as_deref()
        .and_then(LogFormat::parse)
        .unwrap_or(LogFormat::Compact);

    Ok(RuntimeSettings {
        data_root: PathBuf::from(data_root),
        newtube_port,
        newtube_host,
        upstream_url: lookup("NEWTUBE_UPSTREAM_URL")
            .map(|url| url.trim_end_matches('/').to_string()),
        upstream_key: lookup("NEWTUBE_UPSTREAM_KEY"),
        feed_ttl: Duration::from_secs(
            parsed("NEWTUBE_FEED_TTL_SECS").unwrap_or(DEFAULT_FEED_TTL_SECS),
        ),
        metadata_ttl: Duration::from_secs(
            parsed("NEWTUBE_METADATA_TTL_SECS").unwrap_or(DEFAULT_METADATA_TTL_SECS),
        ),
        fallback_max_age: Duration::from_secs(
            parsed("NEWTUBE_FALLBACK_MAX_AGE_DAYS")
                .unwrap_or(DEFAULT_FALLBACK_MAX_AGE_DAYS)
                .saturating_mul(24 * 60 * 60),
        ),
        cleanup_probability,
        log_format,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Parses a `KEY=value` env file. A missing file yields an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
