// ── Audit feed ──
//
// The filtering and bookkeeping behind the aggregator, free of I/O and
// clocks: callers pass the monotonic instant and wall-clock time of each
// event, so every rule here is deterministic under test.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use strum::Display;
use tokio::time::Instant;

use parkline_api::{AdminUpdate, ZoneState};

use super::entry::AuditLogEntry;
use crate::config::AuditConfig;

/// What happened to one incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Outcome {
    Added,
    /// An equivalent entry is already in the log.
    Duplicate,
    /// Same zone accepted less than the throttle interval ago.
    Throttled,
    /// Zone updates are ignored until warm-up ends.
    WarmingUp,
    /// Occupancy matches the zone's newest entry.
    Unchanged,
}

impl Outcome {
    pub fn is_added(self) -> bool {
        self == Self::Added
    }
}

/// Bounded, newest-first audit log plus the per-zone throttle clock.
#[derive(Debug, Clone)]
pub struct AuditFeed {
    config: AuditConfig,
    entries: Vec<AuditLogEntry>,
    zone_accepted_at: HashMap<String, Instant>,
    /// `None` until warm-up starts; zone updates are ignored until then too.
    warm_up_until: Option<Instant>,
}

impl AuditFeed {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            zone_accepted_at: HashMap::new(),
            warm_up_until: None,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Newest first.
    pub fn entries(&self) -> &[AuditLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ── Warm-up ──────────────────────────────────────────────────

    pub fn start_warm_up(&mut self, now: Instant) {
        self.warm_up_until = Some(now + self.config.warm_up);
    }

    pub fn is_warming_up(&self, now: Instant) -> bool {
        self.warm_up_until.is_none_or(|until| now < until)
    }

    // ── Ingestion ────────────────────────────────────────────────

    /// Admin actions bypass warm-up and throttling.
    pub fn apply_admin(&mut self, update: &AdminUpdate) -> Outcome {
        self.insert(AuditLogEntry::from_admin_update(update))
    }

    /// Zone snapshots pass throttle, warm-up and significance in that order.
    /// Only updates that clear warm-up move the throttle clock.
    pub fn apply_zone(&mut self, zone: &ZoneState, now: Instant, at: DateTime<Utc>) -> Outcome {
        if let Some(last) = self.zone_accepted_at.get(&zone.id) {
            if now.saturating_duration_since(*last) < self.config.zone_throttle {
                return Outcome::Throttled;
            }
        }

        if self.is_warming_up(now) {
            return Outcome::WarmingUp;
        }

        self.zone_accepted_at.insert(zone.id.clone(), now);

        let newest = self
            .entries
            .iter()
            .find(|e| e.is_zone_state() && e.target_id == zone.id);
        if newest.is_some_and(|e| e.occupied() == u64::from(zone.occupied)) {
            return Outcome::Unchanged;
        }

        self.insert(AuditLogEntry::from_zone_state(zone, at))
    }

    /// Prepend `entry` unless it duplicates one already logged, then trim to
    /// capacity.
    pub fn insert(&mut self, entry: AuditLogEntry) -> Outcome {
        let window = self.config.admin_dedup_window;
        if self.entries.iter().any(|e| entry.duplicates(e, window)) {
            return Outcome::Duplicate;
        }

        self.entries.insert(0, entry);
        self.entries.truncate(self.config.max_entries);
        Outcome::Added
    }

    // ── Bulk operations ──────────────────────────────────────────

    /// Adopt persisted entries. Ignored when the log already has entries.
    /// Returns whether anything was loaded.
    pub fn restore(&mut self, mut entries: Vec<AuditLogEntry>) -> bool {
        if !self.entries.is_empty() {
            return false;
        }
        entries.truncate(self.config.max_entries);
        self.entries = entries;
        true
    }

    pub fn clear_entries(&mut self) {
        self.entries.clear();
    }

    /// Back to the freshly constructed state.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.zone_accepted_at.clear();
        self.warm_up_until = None;
    }
}
