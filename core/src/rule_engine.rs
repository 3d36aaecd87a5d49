//! ActionRuleEngine: evaluates active rules against a new cluster and
//! executes the defense action of every rule that fires.
//!
//! RULE: Rules are independent. One rule's failure never stops the next.
//! RULE: Every rule that fires and resolves a target writes exactly one
//!       history row, `success` only when the action was stored and enforced.
//!
//! Execution order per fired rule:
//!   1. Derive the target from the cluster metadata (none → skip, no rows)
//!   2. Compute the expiry from the action type and rule severity
//!   3. Insert the DefenseAction
//!   4. Bump the rule's trigger count and last-triggered time
//!   5. Enforce (alerts notify instead)
//!   6. Write history, then notify observers on success

use crate::{
    clock::Clock,
    defense::{
        compute_expiry, derive_target, rate_limit_cap, triggered_by, ActionMetadata, DefenseAction,
        DefenseHistory, HistoryResult, ImpactMetrics,
    },
    enforcement::Enforcer,
    error::EngineResult,
    event::DefenseEvent,
    notify::{self, NotificationSink},
    rule::{default_rules, ActionRule, ActionType},
    store::ThreatStore,
    threat::FraudCluster,
    types::{new_entity_id, EntityId, Timestamp},
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// What one `evaluate_cluster` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationSummary {
    pub rules_evaluated: usize,
    /// Rules skipped because their condition, action type or severity is malformed.
    pub rules_invalid:   usize,
    pub rules_triggered: usize,
    /// Fired rules with nothing to act on.
    pub missing_target:  usize,
    pub succeeded:       usize,
    pub failed:          usize,
    /// Fired rules whose audit row could not be written.
    pub history_failed:  usize,
    pub action_ids:      Vec<EntityId>,
}

impl EvaluationSummary {
    pub fn absorb(&mut self, other: &EvaluationSummary) {
        self.rules_evaluated += other.rules_evaluated;
        self.rules_invalid += other.rules_invalid;
        self.rules_triggered += other.rules_triggered;
        self.missing_target += other.missing_target;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.history_failed += other.history_failed;
        self.action_ids.extend(other.action_ids.iter().cloned());
    }
}

pub struct ActionRuleEngine {
    store:    Arc<ThreatStore>,
    enforcer: Arc<dyn Enforcer>,
    sink:     Arc<dyn NotificationSink>,
    clock:    Arc<dyn Clock>,
    /// Malformed rule ids already warned about.
    reported: Mutex<HashSet<EntityId>>,
}

impl ActionRuleEngine {
    pub fn new(
        store: Arc<ThreatStore>,
        enforcer: Arc<dyn Enforcer>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            enforcer,
            sink,
            clock,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Install the baseline rules that are not present yet (matched by
    /// name). Returns how many were inserted.
    pub fn seed_default_rules(&self) -> EngineResult<usize> {
        let mut created = 0;
        for rule in default_rules() {
            if self.store.rule_exists_by_name(&rule.name)? {
                continue;
            }
            self.store.insert_rule(&rule, self.clock.now())?;
            log::info!("seeded rule '{}' ({})", rule.name, rule.action_type);
            created += 1;
        }
        Ok(created)
    }

    /// Active, well-formed rules, most severe first.
    pub fn load_active_rules(&self) -> EngineResult<(Vec<ActionRule>, usize)> {
        let mut rules = Vec::new();
        let mut invalid = 0;
        for row in self.store.active_rule_rows()? {
            let id = row.id.clone();
            let name = row.name.clone();
            match ActionRule::from_row(row) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    invalid += 1;
                    if self.reported.lock().insert(id.clone()) {
                        log::warn!("rule '{name}' ({id}) is malformed and will never trigger: {e}");
                    }
                }
            }
        }
        Ok((rules, invalid))
    }

    /// Evaluate every active rule against `cluster`. Never fails: problems
    /// are logged and show up in the summary.
    pub fn evaluate_cluster(&self, cluster: &FraudCluster) -> EvaluationSummary {
        let mut summary = EvaluationSummary::default();

        let rules = match self.load_active_rules() {
            Ok((rules, invalid)) => {
                summary.rules_invalid = invalid;
                rules
            }
            Err(e) => {
                log::error!("cannot load rules for cluster {}: {e}", cluster.id);
                return summary;
            }
        };

        for rule in &rules {
            summary.rules_evaluated += 1;
            match rule.condition.evaluate(cluster) {
                Ok(true) => self.execute(rule, cluster, &mut summary),
                Ok(false) => {}
                Err(e) => log::warn!("rule '{}' not evaluated for cluster {}: {e}", rule.name, cluster.id),
            }
        }

        if summary.rules_triggered > 0 {
            log::info!(
                "cluster {}: {} rule(s) fired, {} succeeded, {} failed",
                cluster.id,
                summary.rules_triggered,
                summary.succeeded,
                summary.failed
            );
        }
        summary
    }

    fn execute(&self, rule: &ActionRule, cluster: &FraudCluster, summary: &mut EvaluationSummary) {
        let target = match derive_target(rule.action_type, cluster) {
            Some(t) => t,
            None => {
                log::warn!(
                    "rule '{}' fired for cluster {} but it has no {} target; skipped",
                    rule.name,
                    cluster.id,
                    rule.action_type
                );
                summary.missing_target += 1;
                return;
            }
        };
        summary.rules_triggered += 1;

        let now = self.clock.now();
        let expires_at = compute_expiry(rule.action_type, rule.severity, now);
        let impact = ImpactMetrics {
            threat_count:  cluster.threat_count,
            cluster_score: cluster.score_value().unwrap_or(0.0),
            rule_severity: rule.severity,
            timestamp:     now,
        };

        let (result, action) = match self.apply(rule, cluster, target, now, expires_at) {
            Ok(action) => (HistoryResult::Success, Some(action)),
            Err(e) => {
                log::error!("rule '{}' failed on cluster {}: {e}", rule.name, cluster.id);
                (HistoryResult::Failed, None)
            }
        };

        let history = DefenseHistory {
            id:               new_entity_id(),
            action_id:        action.as_ref().map(|a| a.id.clone()),
            cluster_id:       cluster.id.clone(),
            rule_id:          rule.id.clone(),
            result,
            impact,
            duration_seconds: action
                .as_ref()
                .and_then(|a| a.expires_at)
                .map(|t| (t - now).num_seconds()),
            created_at:       now,
        };
        if let Err(e) = self.store.insert_defense_history(&history) {
            summary.history_failed += 1;
            log::error!(
                "cannot record {} history for rule '{}' on cluster {} (action {}): {e}",
                history.result.as_str(),
                rule.name,
                cluster.id,
                history.action_id.as_deref().unwrap_or("none")
            );
        }

        match action {
            Some(action) => {
                summary.succeeded += 1;
                log::info!(
                    "{} → {} (cluster {}, expires {})",
                    action.name,
                    action.target_value,
                    cluster.id,
                    action.expires_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
                );
                notify::deliver(
                    self.sink.as_ref(),
                    &DefenseEvent::DefenseActionTriggered {
                        action_id:    action.id.clone(),
                        cluster_id:   cluster.id.clone(),
                        action_type:  action.action_type,
                        target_value: action.target_value.clone(),
                    },
                );
                summary.action_ids.push(action.id);
            }
            None => summary.failed += 1,
        }
    }

    /// Steps 3–5. Any error here turns into a `failed` history row.
    fn apply(
        &self,
        rule: &ActionRule,
        cluster: &FraudCluster,
        target: String,
        now: Timestamp,
        expires_at: Option<Timestamp>,
    ) -> EngineResult<DefenseAction> {
        let metadata = ActionMetadata {
            rule_id:          rule.id.clone(),
            cluster_id:       cluster.id.clone(),
            created_at:       now,
            cluster_metadata: cluster.metadata.clone(),
        };
        let action = DefenseAction {
            id:           new_entity_id(),
            name:         format!("Auto: {}", rule.name),
            action_type:  rule.action_type,
            triggered_by: triggered_by(&cluster.id),
            target_value: target,
            severity:     rule.severity,
            is_active:    true,
            expires_at,
            metadata:     serde_json::to_value(&metadata)?,
            created_at:   now,
        };

        self.store.insert_defense_action(&action)?;
        self.store.record_rule_trigger(&rule.id, now)?;
        self.enforce(&action, cluster)?;
        Ok(action)
    }

    fn enforce(&self, action: &DefenseAction, cluster: &FraudCluster) -> EngineResult<()> {
        let target = action.target_value.as_str();
        match action.action_type {
            ActionType::BlockIp => self.enforcer.block_ip(target, action.expires_at),
            ActionType::BlockDevice => self.enforcer.block_device(target, action.expires_at),
            ActionType::RateLimit => {
                self.enforcer.rate_limit(target, rate_limit_cap(action.severity), action.expires_at)
            }
            ActionType::Quarantine => self.enforcer.quarantine(target, action.expires_at),
            ActionType::Alert => {
                notify::deliver(
                    self.sink.as_ref(),
                    &DefenseEvent::HighRiskCluster {
                        cluster_id:   cluster.id.clone(),
                        score:        cluster.score_value()?,
                        threat_count: cluster.threat_count,
                        action_id:    Some(action.id.clone()),
                    },
                );
                Ok(())
            }
        }
    }
}
