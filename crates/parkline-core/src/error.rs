// ── Core error types ──
//
// User-facing errors from parkline-core. Consumers never see tungstenite
// or serde failures directly; the `From<parkline_api::Error>` impl
// translates transport-layer errors into domain variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to console server at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Console server connection timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Storage errors ───────────────────────────────────────────────
    #[error("Storage error for key '{key}': {message}")]
    Storage { key: String, message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn storage(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            key: key.to_owned(),
            message: err.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<parkline_api::Error> for CoreError {
    fn from(err: parkline_api::Error) -> Self {
        match err {
            parkline_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason,
            },
            parkline_api::Error::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            parkline_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            parkline_api::Error::NotConnected => CoreError::ConnectionFailed {
                url: String::new(),
                reason: "WebSocket is not connected".into(),
            },
            parkline_api::Error::Serialization(e) => {
                CoreError::Internal(format!("Serialization error: {e}"))
            }
        }
    }
}
