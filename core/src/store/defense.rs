//! Defense action and defense history queries.

use super::{opt_from_millis, opt_millis, ThreatStore};
use crate::{
    defense::{DefenseAction, DefenseHistory, HistoryResult},
    error::EngineResult,
    rule::ActionType,
    types::{from_millis, Timestamp},
};
use rusqlite::params;

const ACTION_COLUMNS: &str = "id, name, action_type, triggered_by, target_value, severity, \
                              is_active, expires_at, metadata, created_at";

const HISTORY_COLUMNS: &str =
    "id, action_id, cluster_id, rule_id, result, impact, duration_seconds, created_at";

type ActionRaw = (String, String, String, String, String, i64, i64, Option<i64>, String, i64);
type HistoryRaw = (String, Option<String>, String, String, String, String, Option<i64>, i64);

fn read_action(r: &rusqlite::Row<'_>) -> rusqlite::Result<ActionRaw> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
    ))
}

fn into_action(raw: ActionRaw) -> EngineResult<DefenseAction> {
    let (id, name, action_type, triggered_by, target_value, severity, is_active, expires_at, metadata, created_at) =
        raw;
    Ok(DefenseAction {
        id,
        name,
        action_type: ActionType::parse(&action_type)?,
        triggered_by,
        target_value,
        severity: severity.clamp(0, u8::MAX as i64) as u8,
        is_active: is_active != 0,
        expires_at: opt_from_millis(expires_at),
        metadata: serde_json::from_str(&metadata)?,
        created_at: from_millis(created_at),
    })
}

fn read_history(r: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRaw> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn into_history(raw: HistoryRaw) -> EngineResult<DefenseHistory> {
    let (id, action_id, cluster_id, rule_id, result, impact, duration_seconds, created_at) = raw;
    Ok(DefenseHistory {
        id,
        action_id,
        cluster_id,
        rule_id,
        result: HistoryResult::parse(&result)?,
        impact: serde_json::from_str(&impact)?,
        duration_seconds,
        created_at: from_millis(created_at),
    })
}

impl ThreatStore {
    pub fn insert_defense_action(&self, action: &DefenseAction) -> EngineResult<()> {
        let metadata = serde_json::to_string(&action.metadata)?;
        self.conn().execute(
            "INSERT INTO defense_action (
                id, name, action_type, triggered_by, target_value, severity,
                is_active, expires_at, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                action.id,
                action.name,
                action.action_type.as_str(),
                action.triggered_by,
                action.target_value,
                action.severity as i64,
                action.is_active as i64,
                opt_millis(action.expires_at),
                metadata,
                action.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_defense_history(&self, history: &DefenseHistory) -> EngineResult<()> {
        let impact = serde_json::to_string(&history.impact)?;
        self.conn().execute(
            "INSERT INTO defense_history (
                id, action_id, cluster_id, rule_id, result, impact, duration_seconds, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                history.id,
                history.action_id,
                history.cluster_id,
                history.rule_id,
                history.result.as_str(),
                impact,
                history.duration_seconds,
                history.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Active actions that have not expired as of `now`, newest first.
    pub fn active_defense_actions(&self, now: Timestamp) -> EngineResult<Vec<DefenseAction>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTION_COLUMNS} FROM defense_action
                 WHERE is_active = 1 AND (expires_at IS NULL OR expires_at > ?1)
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt
                .query_map(params![now.timestamp_millis()], read_action)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raws.into_iter().map(into_action).collect()
    }

    pub fn defense_actions_for_cluster(&self, cluster_id: &str) -> EngineResult<Vec<DefenseAction>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTION_COLUMNS} FROM defense_action
                 WHERE triggered_by = ?1 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map(params![crate::defense::triggered_by(cluster_id)], read_action)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raws.into_iter().map(into_action).collect()
    }

    pub fn history_for_cluster(&self, cluster_id: &str) -> EngineResult<Vec<DefenseHistory>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM defense_history
                 WHERE cluster_id = ?1 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map(params![cluster_id], read_history)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raws.into_iter().map(into_history).collect()
    }

    pub fn history_since(&self, since: Timestamp) -> EngineResult<Vec<DefenseHistory>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM defense_history
                 WHERE created_at >= ?1 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map(params![since.timestamp_millis()], read_history)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raws.into_iter().map(into_history).collect()
    }

    pub fn count_defense_actions(&self) -> EngineResult<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM defense_action", [], |r| r.get(0))?)
    }

    pub fn count_history(&self, result: Option<HistoryResult>) -> EngineResult<i64> {
        let conn = self.conn();
        let n = match result {
            Some(result) => conn.query_row(
                "SELECT COUNT(*) FROM defense_history WHERE result = ?1",
                params![result.as_str()],
                |r| r.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM defense_history", [], |r| r.get(0))?,
        };
        Ok(n)
    }
}
