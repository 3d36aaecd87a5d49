//! Operator-configured action rules.
//!
//! A rule's condition is stored as JSON `{field, operator, value}` and is
//! parsed into a typed RuleCondition when the rule is loaded. A rule that
//! does not parse is reported once at load and never triggers.

use crate::{
    error::{EngineError, EngineResult},
    threat::FraudCluster,
    types::{EntityId, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Action types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    BlockIp,
    BlockDevice,
    RateLimit,
    Alert,
    Quarantine,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockIp     => "block_ip",
            Self::BlockDevice => "block_device",
            Self::RateLimit   => "rate_limit",
            Self::Alert       => "alert",
            Self::Quarantine  => "quarantine",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "block_ip"     => Ok(Self::BlockIp),
            "block_device" => Ok(Self::BlockDevice),
            "rate_limit"   => Ok(Self::RateLimit),
            "alert"        => Ok(Self::Alert),
            "quarantine"   => Ok(Self::Quarantine),
            other => Err(EngineError::UnknownTag {
                kind:  "action type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Conditions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionField {
    Severity,
    Score,
    ThreatCount,
    PatternType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Gte,
    Gt,
    Eq,
    Contains,
}

/// Scalar a condition compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
    Flag(bool),
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Integral numbers print without a fractional part: 4 not 4.0.
            Self::Number(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s)   => f.write_str(s),
            Self::Flag(b)   => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field:    ConditionField,
    pub operator: ConditionOperator,
    pub value:    ConditionValue,
}

/// Loose shape used to report which part of a stored condition is wrong.
#[derive(Deserialize)]
struct RawCondition {
    field:    String,
    operator: String,
    value:    serde_json::Value,
}

impl RuleCondition {
    pub fn new(field: ConditionField, operator: ConditionOperator, value: ConditionValue) -> Self {
        Self { field, operator, value }
    }

    /// Parse a stored condition document. `rule` names the owner in errors.
    pub fn parse(rule: &str, json: &str) -> EngineResult<Self> {
        let invalid = |reason: String| EngineError::InvalidCondition {
            rule: rule.to_string(),
            reason,
        };

        let raw: RawCondition =
            serde_json::from_str(json).map_err(|e| invalid(format!("not a condition document: {e}")))?;

        let field = match raw.field.as_str() {
            "severity"    => ConditionField::Severity,
            "score"       => ConditionField::Score,
            "threatCount" => ConditionField::ThreatCount,
            "patternType" => ConditionField::PatternType,
            other => return Err(invalid(format!("unknown field '{other}'"))),
        };
        let operator = match raw.operator.as_str() {
            "gte"      => ConditionOperator::Gte,
            "gt"       => ConditionOperator::Gt,
            "eq"       => ConditionOperator::Eq,
            "contains" => ConditionOperator::Contains,
            other => return Err(invalid(format!("unknown operator '{other}'"))),
        };
        let value = match raw.value {
            serde_json::Value::Number(n) => ConditionValue::Number(
                n.as_f64().ok_or_else(|| invalid(format!("number {n} out of range")))?,
            ),
            serde_json::Value::String(s) => ConditionValue::Text(s),
            serde_json::Value::Bool(b)   => ConditionValue::Flag(b),
            other => return Err(invalid(format!("value must be a scalar, got {other}"))),
        };

        Ok(Self { field, operator, value })
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Does `cluster` satisfy this condition? Errors only when the cluster
    /// itself is unreadable (an unparseable score).
    pub fn evaluate(&self, cluster: &FraudCluster) -> EngineResult<bool> {
        let actual = match self.field {
            ConditionField::Severity    => ConditionValue::Number(cluster.severity as f64),
            ConditionField::Score       => ConditionValue::Number(cluster.score_value()?),
            ConditionField::ThreatCount => ConditionValue::Number(cluster.threat_count as f64),
            ConditionField::PatternType => ConditionValue::Text(cluster.pattern_type.as_str().to_string()),
        };
        Ok(compare(&actual, self.operator, &self.value))
    }
}

fn compare(actual: &ConditionValue, operator: ConditionOperator, expected: &ConditionValue) -> bool {
    use ConditionValue::Number;
    match operator {
        ConditionOperator::Gte => matches!((actual, expected), (Number(a), Number(b)) if a >= b),
        ConditionOperator::Gt  => matches!((actual, expected), (Number(a), Number(b)) if a > b),
        // Strict: a number never equals its string spelling.
        ConditionOperator::Eq  => actual == expected,
        ConditionOperator::Contains => actual.to_string().contains(&expected.to_string()),
    }
}

// ── Rules ────────────────────────────────────────────────────────────────────

/// A rule as stored: condition and action type still in their text form.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRuleRow {
    pub id:             EntityId,
    pub name:           String,
    pub condition:      String,
    pub action_type:    String,
    pub severity:       u8,
    pub is_active:      bool,
    pub trigger_count:  i64,
    pub last_triggered: Option<Timestamp>,
    pub metadata:       String,
    pub created_at:     Timestamp,
}

/// A loaded, validated rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRule {
    pub id:             EntityId,
    pub name:           String,
    pub condition:      RuleCondition,
    pub action_type:    ActionType,
    pub severity:       u8,
    pub is_active:      bool,
    pub trigger_count:  i64,
    pub last_triggered: Option<Timestamp>,
    pub metadata:       serde_json::Value,
    pub created_at:     Timestamp,
}

/// Valid rule severities.
pub const RULE_SEVERITY: std::ops::RangeInclusive<u8> = 1..=5;

impl ActionRule {
    /// Validate a stored rule. Metadata is free-form: text that is not a
    /// JSON document is kept as a JSON string.
    pub fn from_row(row: ActionRuleRow) -> EngineResult<Self> {
        let condition = RuleCondition::parse(&row.name, &row.condition)?;
        let action_type = ActionType::parse(&row.action_type)?;
        if !RULE_SEVERITY.contains(&row.severity) {
            return Err(EngineError::InvalidRule {
                rule:   row.name,
                reason: format!("severity {} is outside 1-5", row.severity),
            });
        }
        let metadata = if row.metadata.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&row.metadata)
                .unwrap_or_else(|_| serde_json::Value::String(row.metadata.clone()))
        };
        Ok(Self {
            id: row.id,
            name: row.name,
            condition,
            action_type,
            severity: row.severity,
            is_active: row.is_active,
            trigger_count: row.trigger_count,
            last_triggered: row.last_triggered,
            metadata,
            created_at: row.created_at,
        })
    }
}

/// Input for creating a rule.
#[derive(Debug, Clone)]
pub struct NewActionRule {
    pub name:        String,
    pub condition:   RuleCondition,
    pub action_type: ActionType,
    pub severity:    u8,
    pub metadata:    serde_json::Value,
}

impl NewActionRule {
    pub fn new(name: &str, condition: RuleCondition, action_type: ActionType, severity: u8) -> Self {
        Self {
            name: name.to_string(),
            condition,
            action_type,
            severity,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Baseline rules installed on a fresh database.
pub fn default_rules() -> Vec<NewActionRule> {
    vec![
        NewActionRule::new(
            "High severity IP block",
            RuleCondition::new(ConditionField::Severity, ConditionOperator::Gte, ConditionValue::Number(4.0)),
            ActionType::BlockIp,
            4,
        ),
        NewActionRule::new(
            "Extreme score device block",
            RuleCondition::new(ConditionField::Score, ConditionOperator::Gte, ConditionValue::Number(8.0)),
            ActionType::BlockDevice,
            3,
        ),
        NewActionRule::new(
            "Velocity rate limit",
            RuleCondition::new(
                ConditionField::PatternType,
                ConditionOperator::Eq,
                ConditionValue::Text("velocity".into()),
            ),
            ActionType::RateLimit,
            2,
        ),
        NewActionRule::new(
            "Critical cluster alert",
            RuleCondition::new(ConditionField::Severity, ConditionOperator::Gte, ConditionValue::Number(5.0)),
            ActionType::Alert,
            5,
        ),
    ]
}
