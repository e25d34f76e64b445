// ── Runtime audit configuration ──
//
// Tuning for the audit aggregator. Built by the CLI from parkline-config;
// core never reads config files.

use std::time::Duration;

/// Storage key the audit log persists under.
pub const DEFAULT_STORAGE_KEY: &str = "admin_audit_logs";

/// Limits and windows applied by the audit aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// Log capacity. Oldest entries fall off the end. Default: 100.
    pub max_entries: usize,
    /// Minimum spacing between accepted updates for one zone. Default: 1s.
    pub zone_throttle: Duration,
    /// Zone updates are ignored for this long after initialization. Default: 2s.
    pub warm_up: Duration,
    /// Admin entries this close in time to an identical one are duplicates. Default: 5s.
    pub admin_dedup_window: Duration,
    /// Persisted logs older than this are discarded on load. Default: 24h.
    pub expiry: Duration,
    pub storage_key: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            zone_throttle: Duration::from_secs(1),
            warm_up: Duration::from_secs(2),
            admin_dedup_window: Duration::from_secs(5),
            expiry: Duration::from_secs(24 * 60 * 60),
            storage_key: DEFAULT_STORAGE_KEY.into(),
        }
    }
}
