//! Defense actions and their audit history.
//!
//! An action is created once per rule firing. Its expiry is advisory: the
//! request-time consumer stops enforcing at `expires_at`, this crate never
//! flips `is_active` back.

use crate::{
    error::{EngineError, EngineResult},
    rule::ActionType,
    threat::{ClusterMetadata, FraudCluster},
    types::{EntityId, Timestamp},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

// ── Expiry policy ────────────────────────────────────────────────────────────

const BLOCK_IP_HOURS_PER_SEVERITY:   i64 = 4;
const BLOCK_IP_MAX_HOURS:            i64 = 24;
const BLOCK_DEVICE_DAYS_PER_SEVERITY: i64 = 1;
const BLOCK_DEVICE_MAX_DAYS:         i64 = 7;
const RATE_LIMIT_MINUTES_PER_SEVERITY: i64 = 30;
const RATE_LIMIT_MAX_MINUTES:        i64 = 240;

/// Quarantine target when the cluster names no merchant.
pub const GLOBAL_QUARANTINE: &str = "global";

/// Expiry for an action of `action_type` created at `now` by a rule of
/// `severity`. Alerts and quarantines do not expire.
pub fn compute_expiry(action_type: ActionType, severity: u8, now: Timestamp) -> Option<Timestamp> {
    let severity = severity as i64;
    match action_type {
        ActionType::BlockIp => Some(
            now + Duration::hours((severity * BLOCK_IP_HOURS_PER_SEVERITY).min(BLOCK_IP_MAX_HOURS)),
        ),
        ActionType::BlockDevice => Some(
            now + Duration::days((severity * BLOCK_DEVICE_DAYS_PER_SEVERITY).min(BLOCK_DEVICE_MAX_DAYS)),
        ),
        ActionType::RateLimit => Some(
            now + Duration::minutes(
                (severity * RATE_LIMIT_MINUTES_PER_SEVERITY).min(RATE_LIMIT_MAX_MINUTES),
            ),
        ),
        ActionType::Alert | ActionType::Quarantine => None,
    }
}

/// Requests-per-minute cap applied by a rate limit: max(1, 10 − severity×2).
pub fn rate_limit_cap(severity: u8) -> u32 {
    (10 - severity as i64 * 2).max(1) as u32
}

/// Resolve what an action of `action_type` applies to. None means the
/// cluster carries nothing to act on and the rule is skipped.
pub fn derive_target(action_type: ActionType, cluster: &FraudCluster) -> Option<String> {
    let meta: &ClusterMetadata = &cluster.metadata;
    let target = match action_type {
        ActionType::BlockIp | ActionType::RateLimit => meta.primary_ip.clone(),
        ActionType::BlockDevice => meta.device_fingerprint.clone(),
        ActionType::Alert       => Some(cluster.id.clone()),
        ActionType::Quarantine  => Some(
            meta.merchant_id.clone().unwrap_or_else(|| GLOBAL_QUARANTINE.to_string()),
        ),
    };
    target.filter(|t| !t.is_empty())
}

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseAction {
    pub id:           EntityId,
    pub name:         String,
    pub action_type:  ActionType,
    /// `cluster:<id>`
    pub triggered_by: String,
    pub target_value: String,
    pub severity:     u8,
    pub is_active:    bool,
    pub expires_at:   Option<Timestamp>,
    pub metadata:     serde_json::Value,
    pub created_at:   Timestamp,
}

/// Metadata document stored on every auto-created action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetadata {
    pub rule_id:          EntityId,
    pub cluster_id:       EntityId,
    pub created_at:       Timestamp,
    pub cluster_metadata: ClusterMetadata,
}

pub fn triggered_by(cluster_id: &str) -> String {
    format!("cluster:{cluster_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryResult {
    Success,
    Failed,
}

impl HistoryResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed  => "failed",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "success" => Ok(Self::Success),
            "failed"  => Ok(Self::Failed),
            other => Err(EngineError::UnknownTag {
                kind:  "history result",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactMetrics {
    pub threat_count:  usize,
    pub cluster_score: f64,
    pub rule_severity: u8,
    pub timestamp:     Timestamp,
}

/// One audit row per triggered rule, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseHistory {
    pub id:               EntityId,
    /// None when the action could not be created or enforced.
    pub action_id:        Option<EntityId>,
    pub cluster_id:       EntityId,
    pub rule_id:          EntityId,
    pub result:           HistoryResult,
    pub impact:           ImpactMetrics,
    pub duration_seconds: Option<i64>,
    pub created_at:       Timestamp,
}
