//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use parkline_config::ConfigError;
use parkline_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to the console server at {url}")]
    #[diagnostic(
        code(parkline::connection_failed),
        help(
            "Check that the console server is running and reachable.\n\
             URL: {url}\n\
             Override it with --server ws://host:port/api/v1/ws"
        )
    )]
    ConnectionFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Connection timed out after {millis}ms")]
    #[diagnostic(
        code(parkline::timeout),
        help("Raise server.connect_timeout_ms in the config file or check server responsiveness.")
    )]
    Timeout { millis: u64 },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(parkline::validation))]
    Validation { field: String, reason: String },

    #[error("No gates to watch")]
    #[diagnostic(
        code(parkline::no_gates),
        help(
            "Pass one or more --gate GATE_ID, or list them under `gates` in {path}"
        )
    )]
    NoGates { path: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration file already exists at {path}")]
    #[diagnostic(code(parkline::config_exists), help("Use --force to overwrite it."))]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(parkline::config))]
    Config(Box<ConfigError>),

    // ── Storage ──────────────────────────────────────────────────────
    #[error("Audit log storage failed for '{key}': {message}")]
    #[diagnostic(
        code(parkline::storage),
        help("Check permissions on the storage directory, or pass --storage-dir.")
    )]
    Storage { key: String, message: String },

    // ── Internal / IO / Serialization ────────────────────────────────
    #[error("Internal error: {0}")]
    #[diagnostic(code(parkline::internal))]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON output failed: {0}")]
    #[diagnostic(code(parkline::json))]
    Json(#[from] serde_json::Error),

    #[error("YAML output failed: {0}")]
    #[diagnostic(code(parkline::yaml))]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML output failed: {0}")]
    #[diagnostic(code(parkline::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::NoGates { .. } | Self::ConfigExists { .. } => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            other => CliError::Config(Box::new(other)),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed {
                url,
                source: reason.into(),
            },
            CoreError::Timeout { timeout_ms } => CliError::Timeout { millis: timeout_ms },
            CoreError::Storage { key, message } => CliError::Storage { key, message },
            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}
