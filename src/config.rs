use crate::storage::StorageOptions;
use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER: &str = "vlbimon2.science.ru.nl";
const DEFAULT_SECRETS_FILE: &str = "~/.vlbimonitor-secrets.yaml";

#[derive(Debug, Clone)]
pub struct Config {
    /// Bare host or full URL of the monitoring service.
    pub server: String,
    pub db_path: PathBuf,
    pub catalog_path: PathBuf,
    pub secrets_file: PathBuf,
    pub state_dir: PathBuf,
    pub stop_file: PathBuf,

    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub session_retry_secs: u64,
    pub heartbeat_secs: u64,

    pub dedupe_events: bool,
    pub add_points: bool,

    pub wal_autocheckpoint: u32,
    pub busy_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let server = env_string("BRIDGE_SERVER", Some(DEFAULT_SERVER.to_string()))?;
        let db_path = PathBuf::from(env_string("BRIDGE_DB_PATH", Some("vlbimon.db".to_string()))?);
        let catalog_path = PathBuf::from(env_string(
            "BRIDGE_CATALOG_PATH",
            Some("masterlist.json".to_string()),
        )?);
        let secrets_file = expand_home(&env_string(
            "BRIDGE_SECRETS_FILE",
            Some(DEFAULT_SECRETS_FILE.to_string()),
        )?);
        let state_dir = PathBuf::from(env_string("BRIDGE_STATE_DIR", Some(".".to_string()))?);
        let stop_file = match env_optional("BRIDGE_STOP_FILE") {
            Some(path) => PathBuf::from(path),
            None => state_dir.join("PLEASE-STOP"),
        };

        let poll_interval_secs = env_u64("BRIDGE_POLL_INTERVAL_SECS", Some(10))?;
        if poll_interval_secs == 0 {
            bail!("BRIDGE_POLL_INTERVAL_SECS must be positive");
        }
        let http_timeout_secs = env_u64("BRIDGE_HTTP_TIMEOUT_SECS", Some(30))?;
        let session_retry_secs = env_u64("BRIDGE_SESSION_RETRY_SECS", Some(10))?;
        let heartbeat_secs = env_u64("BRIDGE_HEARTBEAT_SECS", Some(300))?;

        let dedupe_events = env_bool("BRIDGE_DEDUPE_EVENTS", true)?;
        let add_points = env_bool("BRIDGE_ADD_POINTS", true)?;

        let wal_autocheckpoint = u32::try_from(env_u64("BRIDGE_WAL_AUTOCHECKPOINT", Some(10_000))?)
            .context("BRIDGE_WAL_AUTOCHECKPOINT out of range")?;
        let busy_timeout_ms = env_u64("BRIDGE_BUSY_TIMEOUT_MS", Some(5_000))?;

        Ok(Self {
            server,
            db_path,
            catalog_path,
            secrets_file,
            state_dir,
            stop_file,
            poll_interval_secs,
            http_timeout_secs,
            session_retry_secs,
            heartbeat_secs,
            dedupe_events,
            add_points,
            wal_autocheckpoint,
            busy_timeout_ms,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn session_retry(&self) -> Duration {
        Duration::from_secs(self.session_retry_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            wal_autocheckpoint: self.wal_autocheckpoint,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateMode {
    Check,
    Fix,
}

/// Settings for the migration runner, on top of [`Config`].
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub mode: MigrateMode,
    /// Written before `fix` touches the database.
    pub backup: Option<PathBuf>,
}

impl MigrateConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let mode = match env_string("BRIDGE_MIGRATE_MODE", Some("check".to_string()))?
            .to_ascii_lowercase()
            .as_str()
        {
            "check" => MigrateMode::Check,
            "fix" => MigrateMode::Fix,
            other => bail!("BRIDGE_MIGRATE_MODE must be check or fix, got {other:?}"),
        };
        let backup = env_optional("BRIDGE_MIGRATE_BACKUP").map(PathBuf::from);
        Ok(Self { mode, backup })
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = env_optional("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_optional(key) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("invalid {key}: expected a boolean, got {value:?}"),
        },
        None => Ok(default),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
