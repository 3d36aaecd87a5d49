//! Enforcement ledger: what a request-time consumer checks before
//! serving a request.

use super::{opt_from_millis, opt_millis, ThreatStore};
use crate::{
    error::{EngineError, EngineResult},
    types::{from_millis, Timestamp},
};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementKind {
    Ip,
    Device,
    RateLimit,
    Merchant,
}

impl EnforcementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip        => "ip",
            Self::Device    => "device",
            Self::RateLimit => "rate_limit",
            Self::Merchant  => "merchant",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "ip"         => Ok(Self::Ip),
            "device"     => Ok(Self::Device),
            "rate_limit" => Ok(Self::RateLimit),
            "merchant"   => Ok(Self::Merchant),
            other => Err(EngineError::UnknownTag {
                kind:  "enforcement kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementEntry {
    pub kind:                EnforcementKind,
    pub target:              String,
    /// None = in force until lifted manually.
    pub until:               Option<Timestamp>,
    pub requests_per_minute: Option<u32>,
    pub created_at:          Timestamp,
}

impl ThreatStore {
    pub fn insert_enforcement(&self, entry: &EnforcementEntry) -> EngineResult<()> {
        self.conn().execute(
            "INSERT INTO enforcement_entry (kind, target, until, requests_per_minute, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.kind.as_str(),
                entry.target,
                opt_millis(entry.until),
                entry.requests_per_minute.map(|n| n as i64),
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Entries for `kind`/`target` still in force at `now`, newest first.
    pub fn active_enforcement(
        &self,
        kind: EnforcementKind,
        target: &str,
        now: Timestamp,
    ) -> EngineResult<Vec<EnforcementEntry>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT kind, target, until, requests_per_minute, created_at
                 FROM enforcement_entry
                 WHERE kind = ?1 AND target = ?2 AND (until IS NULL OR until > ?3)
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![kind.as_str(), target, now.timestamp_millis()], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<i64>>(2)?,
                        r.get::<_, Option<i64>>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        raws.into_iter()
            .map(|(kind, target, until, rpm, created_at)| -> EngineResult<EnforcementEntry> {
                Ok(EnforcementEntry {
                    kind: EnforcementKind::parse(&kind)?,
                    target,
                    until: opt_from_millis(until),
                    requests_per_minute: rpm.map(|n| n.clamp(0, u32::MAX as i64) as u32),
                    created_at: from_millis(created_at),
                })
            })
            .collect()
    }
}
