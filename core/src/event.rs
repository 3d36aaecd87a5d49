//! Real-time notifications emitted by the engines.
//!
//! RULE: Notifications are one-way. Nothing in the core waits on delivery
//! or changes behaviour when a sink fails.

use crate::{
    rule::ActionType,
    threat::PatternType,
    types::{EntityId, Timestamp},
};
use serde::{Deserialize, Serialize};

/// Variants are added, never removed or renamed: the tag is the wire name
/// observers subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DefenseEvent {
    NewFraudCluster {
        #[serde(rename = "clusterId")]
        cluster_id: EntityId,
        title: String,
        severity: u8,
        score: f64,
        #[serde(rename = "matchedThreatCount")]
        matched_threat_count: usize,
        timestamp: Timestamp,
        #[serde(rename = "patternType")]
        pattern_type: PatternType,
    },
    DefenseActionTriggered {
        #[serde(rename = "actionId")]
        action_id: EntityId,
        #[serde(rename = "clusterId")]
        cluster_id: EntityId,
        #[serde(rename = "actionType")]
        action_type: ActionType,
        #[serde(rename = "targetValue")]
        target_value: String,
    },
    HighRiskCluster {
        #[serde(rename = "clusterId")]
        cluster_id: EntityId,
        score: f64,
        #[serde(rename = "threatCount")]
        threat_count: usize,
        #[serde(rename = "actionId")]
        action_id: Option<EntityId>,
    },
}

impl DefenseEvent {
    /// Stable channel name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewFraudCluster { .. }        => "new-fraud-cluster",
            Self::DefenseActionTriggered { .. } => "defense-action-triggered",
            Self::HighRiskCluster { .. }        => "high-risk-cluster",
        }
    }
}
