// parkline-core: audit aggregation layer between parkline-api and consumers (CLI).

pub mod audit;
pub mod config;
pub mod error;
pub mod persist;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use audit::{
    AggregatorState, AuditAggregator, AuditFeed, AuditLogEntry, LogSubscription, Outcome,
    SYSTEM_ACTOR,
};
pub use config::AuditConfig;
pub use error::CoreError;
pub use persist::{FileStore, KeyValueStore, MemoryStore, PersistedLogs};
pub use stream::LogStream;

// Wire types consumers need alongside the aggregator.
pub use parkline_api::{
    AuditAction, ConnectionEvent, ConnectionManager, ConnectionStatus, ReconnectConfig,
    TargetType,
};
