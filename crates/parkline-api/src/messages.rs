//! Wire schema for the console's real-time channel.
//!
//! Inbound frames are JSON text of the shape `{ "type": ..., "payload": ... }`
//! and decode into [`ServerMessage`]. Outbound control frames are
//! [`ClientFrame`]s. Both are tagged enums so downstream code matches
//! exhaustively instead of probing fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

// ── Tags ─────────────────────────────────────────────────────────────

/// Administrative action reported by the server, plus the one action the
/// audit feed derives locally from zone occupancy.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AuditAction {
    CategoryRatesChanged,
    ZoneClosed,
    ZoneOpened,
    VacationAdded,
    RushUpdated,
    UserAdded,
    ZoneStateChanged,
}

/// Kind of resource an action targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TargetType {
    Category,
    Zone,
    Vacation,
    Rush,
    User,
}

/// Listener topic. `All` receives every message regardless of its own type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum MessageTopic {
    ZoneUpdate,
    AdminUpdate,
    All,
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Occupancy snapshot broadcast for one zone.
///
/// Only `id` is required; the server computes the counters and the console
/// tolerates partial payloads rather than dropping them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneState {
    pub id: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub gate_ids: Vec<String>,
    #[serde(default)]
    pub total_slots: u32,
    #[serde(default)]
    pub occupied: u32,
    #[serde(default)]
    pub free: u32,
    #[serde(default)]
    pub reserved: u32,
    #[serde(default)]
    pub available_for_visitors: u32,
    #[serde(default)]
    pub available_for_subscribers: u32,
    #[serde(default)]
    pub rate_normal: f64,
    #[serde(default)]
    pub rate_special: f64,
    #[serde(default)]
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_count: Option<u32>,
    /// Whether the special rate is currently in effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_active: Option<bool>,
}

/// An administrative action asserted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUpdate {
    pub admin_id: String,
    pub action: AuditAction,
    pub target_type: TargetType,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// ISO-8601, kept exactly as the server sent it.
    pub timestamp: String,
}

impl AdminUpdate {
    /// The server timestamp, if it parses.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Parse an RFC 3339 / ISO-8601 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A decoded server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    ZoneUpdate(ZoneState),
    AdminUpdate(AdminUpdate),
}

impl ServerMessage {
    /// Decode a text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The listener topic this message is dispatched under.
    pub fn topic(&self) -> MessageTopic {
        match self {
            Self::ZoneUpdate(_) => MessageTopic::ZoneUpdate,
            Self::AdminUpdate(_) => MessageTopic::AdminUpdate,
        }
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePayload {
    pub gate_id: String,
}

/// A client → server control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe(GatePayload),
    Unsubscribe(GatePayload),
}

impl ClientFrame {
    pub fn subscribe(gate_id: impl Into<String>) -> Self {
        Self::Subscribe(GatePayload {
            gate_id: gate_id.into(),
        })
    }

    pub fn unsubscribe(gate_id: impl Into<String>) -> Self {
        Self::Unsubscribe(GatePayload {
            gate_id: gate_id.into(),
        })
    }

    pub fn gate_id(&self) -> &str {
        match self {
            Self::Subscribe(p) | Self::Unsubscribe(p) => &p.gate_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decode_zone_update() {
        let raw = serde_json::json!({
            "type": "zone-update",
            "payload": {
                "id": "zone_a",
                "name": "Zone A",
                "categoryId": "cat_premium",
                "gateIds": ["gate_1"],
                "totalSlots": 100,
                "occupied": 42,
                "free": 58,
                "reserved": 10,
                "availableForVisitors": 48,
                "availableForSubscribers": 10,
                "rateNormal": 5.0,
                "rateSpecial": 8.0,
                "open": true,
                "specialActive": false
            }
        });

        let msg = ServerMessage::from_json(&raw.to_string()).unwrap();
        assert_eq!(msg.topic(), MessageTopic::ZoneUpdate);
        let ServerMessage::ZoneUpdate(zone) = msg else {
            panic!("expected zone update");
        };
        assert_eq!(zone.id, "zone_a");
        assert_eq!(zone.occupied, 42);
        assert_eq!(zone.available_for_visitors, 48);
        assert_eq!(zone.special_active, Some(false));
        assert!(zone.open);
    }

    #[test]
    fn partial_zone_payload_defaults_counters() {
        let msg =
            ServerMessage::from_json(r#"{"type":"zone-update","payload":{"id":"Z9"}}"#).unwrap();
        let ServerMessage::ZoneUpdate(zone) = msg else {
            panic!("expected zone update");
        };
        assert_eq!(zone.occupied, 0);
        assert!(!zone.open);
        assert!(zone.gate_ids.is_empty());
    }

    #[test]
    fn decode_admin_update() {
        let raw = r#"{
            "type": "admin-update",
            "payload": {
                "adminId": "admin_1",
                "action": "category-rates-changed",
                "targetType": "category",
                "targetId": "cat_premium",
                "details": { "rateNormal": 6.5 },
                "timestamp": "2026-02-10T12:00:00Z"
            }
        }"#;

        let msg = ServerMessage::from_json(raw).unwrap();
        assert_eq!(msg.topic(), MessageTopic::AdminUpdate);
        let ServerMessage::AdminUpdate(update) = msg else {
            panic!("expected admin update");
        };
        assert_eq!(update.admin_id, "admin_1");
        assert_eq!(update.action, AuditAction::CategoryRatesChanged);
        assert_eq!(update.target_type, TargetType::Category);
        assert_eq!(update.details.as_ref().unwrap()["rateNormal"], 6.5);
        assert_eq!(update.timestamp, "2026-02-10T12:00:00Z");
        assert_eq!(
            update.sent_at().unwrap().to_rfc3339(),
            "2026-02-10T12:00:00+00:00"
        );
    }

    #[test]
    fn admin_timestamp_survives_a_round_trip_untouched() {
        let raw = r#"{"type":"admin-update","payload":{
            "adminId":"a","action":"zone-opened","targetType":"zone","targetId":"Z1",
            "timestamp":"2026-02-10T12:00:00.000Z"}}"#;
        let ServerMessage::AdminUpdate(update) = ServerMessage::from_json(raw).unwrap() else {
            panic!("expected admin update");
        };
        let encoded = serde_json::to_value(&update).unwrap();
        assert_eq!(encoded["timestamp"], "2026-02-10T12:00:00.000Z");
    }

    #[test]
    fn unparsable_timestamp_is_kept_but_has_no_instant() {
        assert!(parse_timestamp("yesterday-ish").is_none());
        assert_eq!(
            parse_timestamp("2026-02-10T13:00:00+01:00"),
            parse_timestamp("2026-02-10T12:00:00Z")
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ServerMessage::from_json(r#"{"type":"ticket-printed","payload":{}}"#).is_err());
        assert!(ServerMessage::from_json("not json at all").is_err());
    }

    #[test]
    fn admin_update_requires_timestamp() {
        let raw = r#"{"type":"admin-update","payload":{
            "adminId":"a","action":"zone-opened","targetType":"zone","targetId":"Z1"}}"#;
        assert!(ServerMessage::from_json(raw).is_err());
    }

    #[test]
    fn encode_control_frames() {
        assert_eq!(
            ClientFrame::subscribe("gate_1").to_json().unwrap(),
            r#"{"type":"subscribe","payload":{"gateId":"gate_1"}}"#
        );
        assert_eq!(
            ClientFrame::unsubscribe("gate_1").to_json().unwrap(),
            r#"{"type":"unsubscribe","payload":{"gateId":"gate_1"}}"#
        );
    }

    #[test]
    fn action_tags_match_wire_names() {
        assert_eq!(AuditAction::ZoneStateChanged.to_string(), "zone-state-changed");
        assert_eq!(
            AuditAction::from_str("rush-updated").unwrap(),
            AuditAction::RushUpdated
        );
        assert_eq!(MessageTopic::from_str("all").unwrap(), MessageTopic::All);
        assert_eq!(TargetType::Vacation.as_ref(), "vacation");
    }
}
