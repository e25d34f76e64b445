//! Real-time client for the parking console.
//!
//! One [`ConnectionManager`] owns the WebSocket to the server, tracks gate
//! subscriptions, and dispatches typed [`ServerMessage`]s to listeners.
//! Reconnection after abnormal closes is bounded and linear.

pub mod error;
pub mod listeners;
pub mod messages;
pub mod websocket;

pub use error::Error;
pub use listeners::{ListenerHandle, ListenerRegistry};
pub use messages::{
    AdminUpdate, AuditAction, ClientFrame, GatePayload, MessageTopic, ServerMessage, TargetType,
    ZoneState, parse_timestamp,
};
pub use websocket::{
    ConnectionEvent, ConnectionManager, ConnectionStatus, DEFAULT_URL, MessageListener,
    ReconnectConfig, reconnect_delay,
};
