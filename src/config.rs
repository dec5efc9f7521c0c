use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, anyhow, bail};
use serde::Serialize;

/// Service configuration, assembled once at startup. Every knob has a
/// baked-in default and a `DEBRIEF_*` environment override; there is no
/// config file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// Model tag sent to the backend when a job does not name one.
    pub model: String,
    /// Context window in tokens. Bounds both the composed prompt and the
    /// `num_ctx` option sent to the backend.
    pub context_budget: usize,
    /// Base URL of the inference backend.
    pub backend_url: String,
    /// Per-request deadline for backend calls.
    pub timeout_secs: u64,
    /// How many times a transiently failed job is re-queued.
    pub retry_limit: u32,
    /// Base delay before a retry; scales linearly with the attempt number.
    pub retry_delay_ms: u64,
    /// Terminal jobs older than this are purged at startup.
    pub retention_days: i64,
    /// Root directory scanned for session transcripts.
    pub sessions_dir: PathBuf,
    /// Directory receiving appended analysis artifacts.
    pub artifacts_dir: PathBuf,
    /// SQLite database URL for the job table.
    pub database_url: String,
    /// Optional Prometheus exporter listen address.
    pub metrics_listen: Option<SocketAddr>,
}

pub const DEFAULT_MODEL: &str = "qwen2.5:72b";
pub const DEFAULT_CONTEXT_BUDGET: usize = 32_768;
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:11434";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Blank values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend_url = get("DEBRIEF_BACKEND_URL").unwrap_or_else(|| DEFAULT_BACKEND_URL.into());
        let parsed = url::Url::parse(&backend_url)
            .with_context(|| format!("DEBRIEF_BACKEND_URL: invalid URL {backend_url:?}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            bail!("DEBRIEF_BACKEND_URL: unsupported scheme {:?}", parsed.scheme());
        }

        let sessions_dir = match get("DEBRIEF_SESSIONS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|home| home.join(".claude").join("projects"))
                .ok_or_else(|| anyhow!("cannot determine home directory; set DEBRIEF_SESSIONS_DIR"))?,
        };

        let artifacts_dir = match get("DEBRIEF_ARTIFACTS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(&get)?.join("artifacts"),
        };

        let database_url = match get("DEBRIEF_DATABASE_URL") {
            Some(url) => url,
            None => {
                let path = default_data_dir(&get)?.join("debrief.db");
                format!("sqlite:{}", path.display())
            }
        };

        let metrics_listen = get("DEBRIEF_METRICS_LISTEN")
            .map(|raw| {
                raw.trim()
                    .parse::<SocketAddr>()
                    .map_err(|e| anyhow!("DEBRIEF_METRICS_LISTEN: invalid address {raw:?}: {e}"))
            })
            .transpose()?;

        Ok(Config {
            model: get("DEBRIEF_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            context_budget: parse_var(&get, "DEBRIEF_CTX", DEFAULT_CONTEXT_BUDGET)?,
            backend_url,
            timeout_secs: parse_var(&get, "DEBRIEF_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?,
            retry_limit: parse_var(&get, "DEBRIEF_RETRY_LIMIT", DEFAULT_RETRY_LIMIT)?,
            retry_delay_ms: parse_var(&get, "DEBRIEF_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?,
            retention_days: parse_var(&get, "DEBRIEF_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?,
            sessions_dir,
            artifacts_dir,
            database_url,
            metrics_listen,
        })
    }
}

/// Per-job model resolution: an explicit request value wins over the
/// configured default.
pub fn effective_model(requested: Option<&str>, config: &Config) -> String {
    match requested {
        Some(model) if !model.trim().is_empty() => model.trim().to_string(),
        _ => config.model.clone(),
    }
}

fn parse_var<F, T>(get: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{key}: invalid value {raw:?}: {e}")),
        None => Ok(default),
    }
}

fn default_data_dir<F>(get: &F) -> anyhow::Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(xdg) = get("XDG_DATA_HOME") {
        return Ok(PathBuf::from(xdg).join("debrief"));
    }
    if let Some(home) = get("HOME") {
        return Ok(PathBuf::from(home).join(".local").join("share").join("debrief"));
    }
    bail!("neither XDG_DATA_HOME nor HOME is set; set DEBRIEF_DATABASE_URL and DEBRIEF_ARTIFACTS_DIR")
}
