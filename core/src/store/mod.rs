//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Engines call store methods. They never execute SQL directly.
//!
//! The connection sits behind a mutex so one store can be shared by the
//! cluster engine, the rule engine and the scheduler's worker thread. Each
//! method holds the lock only for its own statements.

use crate::error::EngineResult;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

mod clusters;
mod defense;
mod enforcement;
mod events;
mod rules;

pub use enforcement::{EnforcementEntry, EnforcementKind};

pub struct ThreatStore {
    conn: Mutex<Connection>,
}

impl ThreatStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode: readers do not block the engine's writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Apply all schema migrations in order. Idempotent.
    pub fn migrate(&self) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../../migrations/001_threat_events.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/002_clusters.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/003_rules_and_defense.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/004_enforcement.sql"))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Optional timestamp → nullable millisecond column.
pub(crate) fn opt_millis(t: Option<crate::types::Timestamp>) -> Option<i64> {
    t.map(|t| t.timestamp_millis())
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<crate::types::Timestamp> {
    ms.map(crate::types::from_millis)
}
