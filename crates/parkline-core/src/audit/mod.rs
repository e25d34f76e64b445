//! Audit log: entries, filtering rules, and the aggregating service.

mod aggregator;
mod entry;
mod feed;

pub use aggregator::{AggregatorState, AuditAggregator, LogSubscription};
pub use entry::{AuditLogEntry, SYSTEM_ACTOR, zone_details};
pub use feed::{AuditFeed, Outcome};
