//! Fraud signal event queries. The engines only read; inserts exist for
//! ingestion tooling and tests.

use super::{opt_from_millis, opt_millis, ThreatStore};
use crate::{
    error::EngineResult,
    threat::ThreatEvent,
    types::{EventId, Timestamp},
};
use rusqlite::params;

impl ThreatStore {
    pub fn insert_threat_event(&self, event: &ThreatEvent) -> EngineResult<EventId> {
        let metadata = if event.metadata.is_null() {
            "{}".to_string()
        } else {
            serde_json::to_string(&event.metadata)?
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO threat_event (
                ip_address, user_agent, device_fingerprint, merchant_id,
                timestamp, threat_type, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.ip_address,
                event.user_agent,
                event.device_fingerprint,
                event.merchant_id,
                opt_millis(event.timestamp),
                event.threat_type,
                metadata,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events at or after `since`, newest first, at most `limit` rows.
    pub fn fetch_events_since(&self, since: Timestamp, limit: usize) -> EngineResult<Vec<ThreatEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, user_agent, device_fingerprint, merchant_id,
                    timestamp, threat_type, metadata
             FROM threat_event
             WHERE timestamp >= ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since.timestamp_millis(), limit as i64], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<i64>>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, ip, ua, device, merchant, ts, threat_type, metadata) in rows {
            events.push(ThreatEvent {
                id,
                ip_address: ip,
                user_agent: ua,
                device_fingerprint: device,
                merchant_id: merchant,
                timestamp: opt_from_millis(ts),
                threat_type,
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(events)
    }

    pub fn count_events_since(&self, since: Timestamp) -> EngineResult<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM threat_event WHERE timestamp >= ?1",
            params![since.timestamp_millis()],
            |r| r.get(0),
        )?)
    }

    pub fn count_events(&self) -> EngineResult<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM threat_event", [], |r| r.get(0))?)
    }
}
