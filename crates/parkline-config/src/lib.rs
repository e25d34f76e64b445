//! Shared configuration for the parkline tools.
//!
//! TOML file + environment, layered with figment, and translation to the
//! runtime types in `parkline_api` and `parkline_core`. The CLI adds
//! flag overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use parkline_api::{DEFAULT_URL, ReconnectConfig};
use parkline_core::AuditConfig;
use parkline_core::config::DEFAULT_STORAGE_KEY;

/// Environment prefix. Nested keys use a double underscore:
/// `PARKLINE_SERVER__URL`, `PARKLINE_AUDIT__WARM_UP_MS`.
pub const ENV_PREFIX: &str = "PARKLINE_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,

    #[serde(default)]
    pub audit: Audit,

    #[serde(default)]
    pub storage: Storage,

    #[serde(default)]
    pub defaults: Defaults,

    /// Gates `watch` subscribes to when none are given on the command line.
    #[serde(default)]
    pub gates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Server {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.into(),
            connect_timeout_ms: 5000,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Audit {
    pub max_entries: usize,
    pub zone_throttle_ms: u64,
    pub warm_up_ms: u64,
    pub admin_dedup_window_ms: u64,
    pub expiry_hours: u64,
    pub storage_key: String,
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            max_entries: 100,
            zone_throttle_ms: 1000,
            warm_up_ms: 2000,
            admin_dedup_window_ms: 5000,
            expiry_hours: 24,
            storage_key: DEFAULT_STORAGE_KEY.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Storage {
    /// Where the audit log is kept. Platform data dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    pub output: String,
    pub color: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: "table".into(),
            color: "auto".into(),
        }
    }
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Parsed and scheme-checked server URL.
    pub fn server_url(&self) -> Result<Url, ConfigError> {
        parse_server_url(&self.server.url)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(self.server.reconnect_base_delay_ms),
            max_attempts: self.server.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(self.server.connect_timeout_ms),
        }
    }

    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            max_entries: self.audit.max_entries,
            zone_throttle: Duration::from_millis(self.audit.zone_throttle_ms),
            warm_up: Duration::from_millis(self.audit.warm_up_ms),
            admin_dedup_window: Duration::from_millis(self.audit.admin_dedup_window_ms),
            expiry: Duration::from_secs(self.audit.expiry_hours.saturating_mul(60 * 60)),
            storage_key: self.audit.storage_key.clone(),
        }
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage.dir.clone().unwrap_or_else(default_storage_dir)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_url()?;

        if self.audit.max_entries == 0 {
            return Err(ConfigError::Validation {
                field: "audit.max_entries".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.audit.storage_key.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "audit.storage_key".into(),
                reason: "must not be empty".into(),
            });
        }
        if let Some(gate) = self.gates.iter().find(|g| g.trim().is_empty()) {
            return Err(ConfigError::Validation {
                field: "gates".into(),
                reason: format!("blank gate id {gate:?}"),
            });
        }
        Ok(())
    }
}

/// Parse a `ws://` or `wss://` URL.
pub fn parse_server_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Validation {
        field: "server.url".into(),
        reason: format!("{e}: {raw}"),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::Validation {
            field: "server.url".into(),
            reason: format!("expected ws:// or wss://, got {other}://"),
        }),
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "parkline", "parkline")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".config").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Platform data directory used for the persisted audit log.
pub fn default_storage_dir() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".local/share"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn home_fallback(sub: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(sub);
    p.push("parkline");
    p
}

// ── Config loading ──────────────────────────────────────────────────

fn figment_for(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load from an explicit file. A missing file just yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment_for(path).extract()?;
    config.validate()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML at `path`, creating parent directories.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
