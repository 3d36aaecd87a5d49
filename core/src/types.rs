//! Shared primitive types used across the defense core.

use chrono::{DateTime, Utc};

/// Row id of a stored fraud signal event.
pub type EventId = i64;

/// A stable, unique identifier for clusters, rules, actions and history rows.
pub type EntityId = String;

/// Wall-clock instant. Persisted as Unix milliseconds.
pub type Timestamp = DateTime<Utc>;

/// Convert a stored millisecond column back into a timestamp.
/// Out-of-range values collapse to the Unix epoch rather than failing a read.
pub fn from_millis(ms: i64) -> Timestamp {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn new_entity_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}
