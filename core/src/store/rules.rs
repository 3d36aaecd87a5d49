//! Action rule queries.

use super::{opt_from_millis, opt_millis, ThreatStore};
use crate::{
    error::EngineResult,
    rule::{ActionRuleRow, NewActionRule},
    types::{from_millis, new_entity_id, EntityId, Timestamp},
};
use rusqlite::{params, OptionalExtension};

const RULE_COLUMNS: &str = "id, name, condition, action_type, severity, is_active, \
                            trigger_count, last_triggered, metadata, created_at";

fn read_rule(r: &rusqlite::Row<'_>) -> rusqlite::Result<ActionRuleRow> {
    Ok(ActionRuleRow {
        id:             r.get(0)?,
        name:           r.get(1)?,
        condition:      r.get(2)?,
        action_type:    r.get(3)?,
        // Out-of-range values read as 0 and are rejected when the rule loads.
        severity:       u8::try_from(r.get::<_, i64>(4)?).unwrap_or(0),
        is_active:      r.get::<_, i64>(5)? != 0,
        trigger_count:  r.get(6)?,
        last_triggered: opt_from_millis(r.get(7)?),
        metadata:       r.get(8)?,
        created_at:     from_millis(r.get(9)?),
    })
}

impl ThreatStore {
    pub fn insert_rule(&self, rule: &NewActionRule, created_at: Timestamp) -> EngineResult<EntityId> {
        let id = new_entity_id();
        let metadata = if rule.metadata.is_null() {
            "{}".to_string()
        } else {
            serde_json::to_string(&rule.metadata)?
        };
        self.insert_rule_row(&ActionRuleRow {
            id: id.clone(),
            name: rule.name.clone(),
            condition: rule.condition.to_json()?,
            action_type: rule.action_type.as_str().to_string(),
            severity: rule.severity,
            is_active: true,
            trigger_count: 0,
            last_triggered: None,
            metadata,
            created_at,
        })?;
        Ok(id)
    }

    /// Insert a rule exactly as given, condition text included. Operators
    /// and tests use this to store rules the engine has not validated.
    pub fn insert_rule_row(&self, row: &ActionRuleRow) -> EngineResult<()> {
        self.conn().execute(
            "INSERT INTO action_rule (
                id, name, condition, action_type, severity, is_active,
                trigger_count, last_triggered, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.id,
                row.name,
                row.condition,
                row.action_type,
                row.severity as i64,
                row.is_active as i64,
                row.trigger_count,
                opt_millis(row.last_triggered),
                row.metadata,
                row.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn rule_exists_by_name(&self, name: &str) -> EngineResult<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM action_rule WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Active rules, highest severity first, oldest first within a severity.
    pub fn active_rule_rows(&self) -> EngineResult<Vec<ActionRuleRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM action_rule
             WHERE is_active = 1
             ORDER BY severity DESC, created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], read_rule)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_rule_rows(&self) -> EngineResult<Vec<ActionRuleRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM action_rule ORDER BY severity DESC, created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], read_rule)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_rule_row(&self, rule_id: &str) -> EngineResult<Option<ActionRuleRow>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM action_rule WHERE id = ?1"),
                params![rule_id],
                read_rule,
            )
            .optional()?)
    }

    /// Bump the trigger counter in place so concurrent firings never lose a count.
    pub fn record_rule_trigger(&self, rule_id: &str, at: Timestamp) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE action_rule
             SET trigger_count = trigger_count + 1, last_triggered = ?2
             WHERE id = ?1",
            params![rule_id, at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn set_rule_active(&self, rule_id: &str, active: bool) -> EngineResult<bool> {
        let changed = self.conn().execute(
            "UPDATE action_rule SET is_active = ?2 WHERE id = ?1",
            params![rule_id, active as i64],
        )?;
        Ok(changed > 0)
    }
}
