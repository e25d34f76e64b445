use thiserror::Error;

/// Top-level error type for the `parkline-api` crate.
///
/// Covers the failure modes of the real-time channel: opening the socket,
/// encoding control frames, and calling into a closed connection.
/// `parkline-core` maps these into its own diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket handshake or transport failure before the socket opened.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// No open event arrived within the connect timeout.
    #[error("WebSocket connection timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The socket is not open.
    #[error("WebSocket is not connected")]
    NotConnected,

    // ── Data ────────────────────────────────────────────────────────
    /// Encoding an outbound control frame failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bad_url_reports_the_parse_error() {
        let err = Error::from(url::Url::parse("not a url").unwrap_err());
        assert!(matches!(err, Error::InvalidUrl(_)));
        assert!(err.to_string().starts_with("Invalid URL"));
    }
}
