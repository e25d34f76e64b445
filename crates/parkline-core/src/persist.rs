// ── Audit log persistence ──
//
// A minimal key/value seam plus the envelope the audit log is stored in.
// Storage failures surface as `CoreError::Storage`; the aggregator logs
// them and carries on with its in-memory state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::AuditLogEntry;
use crate::error::CoreError;

// ── KeyValueStore ────────────────────────────────────────────────────

/// String-valued storage addressed by key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CoreError>;
    fn remove(&self, key: &str) -> Result<(), CoreError>;
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<key>.json`. Keys must be plain file stems.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, CoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(CoreError::storage(key, "invalid storage key"));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::storage(key, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| CoreError::storage(key, e))?;

        // Write beside the target, then rename over it.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(|e| CoreError::storage(key, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CoreError::storage(key, e))
    }

    fn remove(&self, key: &str) -> Result<(), CoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::storage(key, e)),
        }
    }
}

/// In-process store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

// ── Persisted envelope ───────────────────────────────────────────────

/// `{ "logs": [...], "timestamp": <epoch ms> }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedLogs {
    pub logs: Vec<AuditLogEntry>,
    /// Save time in epoch milliseconds. A payload without one never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PersistedLogs {
    pub fn new(logs: Vec<AuditLogEntry>, saved_at: DateTime<Utc>) -> Self {
        Self {
            logs,
            timestamp: Some(saved_at.timestamp_millis()),
        }
    }

    /// Older than `expiry` relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        let Some(saved) = self.timestamp else {
            return false;
        };
        let age_ms = now.timestamp_millis().saturating_sub(saved);
        u128::try_from(age_ms).is_ok_and(|age| age > expiry.as_millis())
    }
}

#[derive(Serialize)]
struct PersistedLogsRef<'a> {
    logs: &'a [AuditLogEntry],
    timestamp: i64,
}

/// Result of reading the stored log.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Missing,
    Loaded(Vec<AuditLogEntry>),
    /// Stale payload; the key was removed.
    Expired,
    /// Unreadable payload; the key was removed.
    Corrupt,
}

/// Write `logs` under `key`, stamped with `now`.
pub fn save_logs(
    store: &dyn KeyValueStore,
    key: &str,
    logs: &[AuditLogEntry],
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let payload = PersistedLogsRef {
        logs,
        timestamp: now.timestamp_millis(),
    };
    let json = serde_json::to_string(&payload).map_err(|e| CoreError::storage(key, e))?;
    store.set(key, &json)?;
    debug!(key, count = logs.len(), "saved audit logs");
    Ok(())
}

/// Read the log stored under `key`, discarding it when stale or corrupt.
pub fn load_logs(
    store: &dyn KeyValueStore,
    key: &str,
    expiry: Duration,
    now: DateTime<Utc>,
) -> Result<LoadOutcome, CoreError> {
    let Some(raw) = store.get(key)? else {
        debug!(key, "no stored audit logs");
        return Ok(LoadOutcome::Missing);
    };

    let persisted: PersistedLogs = match serde_json::from_str(&raw) {
        Ok(persisted) => persisted,
        Err(e) => {
            warn!(key, error = %e, "stored audit logs are corrupt, removing them");
            store.remove(key)?;
            return Ok(LoadOutcome::Corrupt);
        }
    };

    if persisted.is_expired(now, expiry) {
        debug!(key, "stored audit logs expired, removing them");
        store.remove(key)?;
        return Ok(LoadOutcome::Expired);
    }

    debug!(key, count = persisted.logs.len(), "loaded audit logs from storage");
    Ok(LoadOutcome::Loaded(persisted.logs))
}
