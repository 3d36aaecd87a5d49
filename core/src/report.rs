//! Human-readable summary of one manual pass, printed by the operator CLI.

use crate::{
    cluster_engine::ManualAnalysisReport,
    defense::{DefenseAction, HistoryResult},
    error::EngineResult,
    rule::ActionType,
    store::ThreatStore,
    threat::PatternType,
    types::{EntityId, Timestamp},
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// How many clusters the report ranks.
pub const SAMPLE_CLUSTERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReport {
    pub cluster_id:   EntityId,
    pub label:        String,
    pub pattern_type: PatternType,
    pub score:        f64,
    pub severity:     u8,
    pub threat_count: usize,
    pub actions:      Vec<ActionType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorReport {
    pub threats_analyzed: i64,
    pub clusters_created: i64,
    /// Actions stored and enforced.
    pub blocked:          usize,
    pub failed:           usize,
    /// Analysed events that joined no cluster.
    pub ignored:          usize,
    pub rules_created:    usize,
    pub rules_triggered:  usize,
    pub error:            Option<String>,
    pub top_clusters:     Vec<ClusterReport>,
    pub active_actions:   Vec<DefenseAction>,
}

impl OperatorReport {
    pub fn build(
        store: &ThreatStore,
        manual: &ManualAnalysisReport,
        pass_started: Timestamp,
        rules_created: usize,
        now: Timestamp,
    ) -> EngineResult<Self> {
        let history = store.history_since(pass_started)?;
        let rules_triggered = history.iter().map(|h| h.rule_id.as_str()).collect::<BTreeSet<_>>().len();
        let blocked = history.iter().filter(|h| h.result == HistoryResult::Success).count();
        let failed = history.len() - blocked;

        let mut top_clusters = Vec::new();
        for cluster in store.clusters_created_since(pass_started)? {
            let actions = store
                .defense_actions_for_cluster(&cluster.id)?
                .into_iter()
                .map(|a| a.action_type)
                .collect();
            top_clusters.push(ClusterReport {
                score:        cluster.score_value().unwrap_or(0.0),
                cluster_id:   cluster.id,
                label:        cluster.label,
                pattern_type: cluster.pattern_type,
                severity:     cluster.severity,
                threat_count: cluster.threat_count,
                actions,
            });
        }
        top_clusters.sort_by(|a, b| b.score.total_cmp(&a.score));
        top_clusters.truncate(SAMPLE_CLUSTERS);

        let ignored = manual.pass.as_ref().map(|p| p.events_ignored()).unwrap_or(0);

        Ok(Self {
            threats_analyzed: manual.threats_analyzed,
            clusters_created: manual.clusters_found,
            blocked,
            failed,
            ignored,
            rules_created,
            rules_triggered,
            error: manual.error.clone(),
            top_clusters,
            active_actions: store.active_defense_actions(now)?,
        })
    }
}

impl fmt::Display for OperatorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== ANALYSIS SUMMARY ===")?;
        writeln!(f, "  threats analyzed:  {}", self.threats_analyzed)?;
        writeln!(f, "  clusters created:  {}", self.clusters_created)?;
        writeln!(f, "  actions executed:  {}", self.blocked)?;
        writeln!(f, "  actions failed:    {}", self.failed)?;
        writeln!(f, "  events ignored:    {}", self.ignored)?;
        writeln!(f, "  rules created:     {}", self.rules_created)?;
        writeln!(f, "  rules triggered:   {}", self.rules_triggered)?;
        if let Some(e) = &self.error {
            writeln!(f, "  error:             {e}")?;
        }

        if !self.top_clusters.is_empty() {
            writeln!(f)?;
            writeln!(f, "=== TOP CLUSTERS ===")?;
            for (rank, c) in self.top_clusters.iter().enumerate() {
                let actions: Vec<&str> = c.actions.iter().map(|a| a.as_str()).collect();
                writeln!(
                    f,
                    "  {:>2}. [{:.2} sev {}] {} ({}, {} threats){}",
                    rank + 1,
                    c.score,
                    c.severity,
                    c.label,
                    c.pattern_type,
                    c.threat_count,
                    if actions.is_empty() { String::new() } else { format!(" → {}", actions.join(", ")) }
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "=== ACTIVE DEFENSE ACTIONS ({}) ===", self.active_actions.len())?;
        for a in &self.active_actions {
            writeln!(
                f,
                "  {:<13} {:<40} sev {} expires {}",
                a.action_type.as_str(),
                a.target_value,
                a.severity,
                a.expires_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
            )?;
        }
        Ok(())
    }
}
