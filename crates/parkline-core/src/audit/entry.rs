// ── Audit log entry ──
//
// One row of the audit log. Admin actions are copied from the server's
// assertion; zone-state entries are derived locally from occupancy
// snapshots and stamped with the processing time.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use parkline_api::{AdminUpdate, AuditAction, TargetType, ZoneState, parse_timestamp};

/// Actor recorded on entries the console derives itself.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub admin_id: String,
    pub action: AuditAction,
    pub target_type: TargetType,
    pub target_id: String,
    /// ISO-8601. Admin entries carry the server's string unchanged.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuditLogEntry {
    /// Copy an admin assertion verbatim, keeping the server's timestamp.
    pub fn from_admin_update(update: &AdminUpdate) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            admin_id: update.admin_id.clone(),
            action: update.action,
            target_type: update.target_type,
            target_id: update.target_id.clone(),
            timestamp: update.timestamp.clone(),
            details: update.details.clone(),
        }
    }

    /// Derive a `zone-state-changed` entry from an occupancy snapshot.
    pub fn from_zone_state(zone: &ZoneState, at: DateTime<Utc>) -> Self {
        Self {
            id: format!("zone-{}-{}", zone.id, Uuid::new_v4()),
            admin_id: SYSTEM_ACTOR.into(),
            action: AuditAction::ZoneStateChanged,
            target_type: TargetType::Zone,
            target_id: zone.id.clone(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            details: Some(zone_details(zone)),
        }
    }

    /// `timestamp` as an instant. `None` when it does not parse.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    pub fn is_zone_state(&self) -> bool {
        self.action == AuditAction::ZoneStateChanged
    }

    /// `details.occupied` of a zone-state entry. Absent or non-numeric reads as 0.
    pub fn occupied(&self) -> u64 {
        self.details
            .as_ref()
            .and_then(|d| d.get("occupied"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Whether `self` would be a redundant copy of `existing`.
    ///
    /// Zone-state entries match on zone and identical details, with no time
    /// limit. Everything else matches on actor, action and target within
    /// `admin_window` of each other; an unparsable timestamp never matches.
    pub fn duplicates(&self, existing: &Self, admin_window: Duration) -> bool {
        if self.is_zone_state() {
            return existing.is_zone_state()
                && existing.target_id == self.target_id
                && existing.details == self.details;
        }

        existing.admin_id == self.admin_id
            && existing.action == self.action
            && existing.target_type == self.target_type
            && existing.target_id == self.target_id
            && match (existing.recorded_at(), self.recorded_at()) {
                (Some(a), Some(b)) => {
                    u128::from((a - b).num_milliseconds().unsigned_abs())
                        < admin_window.as_millis()
                }
                _ => false,
            }
    }
}

/// The occupancy subset recorded on zone-state entries.
pub fn zone_details(zone: &ZoneState) -> Value {
    json!({
        "occupied": zone.occupied,
        "free": zone.free,
        "availableForVisitors": zone.available_for_visitors,
        "availableForSubscribers": zone.available_for_subscribers,
        "open": zone.open,
    })
}
