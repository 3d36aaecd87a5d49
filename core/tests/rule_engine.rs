//! Rule evaluation, defense actions and their history.

use chrono::{Duration, TimeZone, Utc};
use defense_core::{
    config::DefenseConfig,
    defense::HistoryResult,
    enforcement::Enforcer,
    error::{EngineError, EngineResult},
    rule::{
        ActionRuleRow, ActionType, ConditionField, ConditionOperator, ConditionValue, NewActionRule,
        RuleCondition,
    },
    service::TestRig,
    store::{EnforcementKind, ThreatStore},
    threat::{ClusterMetadata, FraudCluster, PatternType},
    types::Timestamp,
};
use std::sync::Arc;

fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn cluster(id: &str, severity: u8, score: &str, pattern_type: PatternType, meta: ClusterMetadata) -> FraudCluster {
    FraudCluster {
        id:           id.into(),
        label:        format!("test cluster {id}"),
        score:        score.into(),
        severity,
        threat_count: 5,
        pattern_type,
        metadata:     ClusterMetadata { pattern_type: Some(pattern_type), ..meta },
        created_at:   t0(),
    }
}

/// The persisted form of five same-IP card-testing events.
fn scenario_a_cluster() -> FraudCluster {
    cluster(
        "cluster-a",
        5,
        "10.00",
        PatternType::IpBased,
        ClusterMetadata { primary_ip: Some("1.2.3.4".into()), ..Default::default() },
    )
}

fn rule(name: &str, field: ConditionField, op: ConditionOperator, value: ConditionValue, action: ActionType, severity: u8) -> NewActionRule {
    NewActionRule::new(name, RuleCondition::new(field, op, value), action, severity)
}

fn severity_gte(n: f64, action: ActionType, severity: u8) -> NewActionRule {
    rule(
        &format!("severity >= {n} {action}"),
        ConditionField::Severity,
        ConditionOperator::Gte,
        ConditionValue::Number(n),
        action,
        severity,
    )
}

fn raw_rule(id: &str, condition: &str, action_type: &str) -> ActionRuleRow {
    ActionRuleRow {
        id:             id.into(),
        name:           format!("raw {id}"),
        condition:      condition.into(),
        action_type:    action_type.into(),
        severity:       5,
        is_active:      true,
        trigger_count:  0,
        last_triggered: None,
        metadata:       "{}".into(),
        created_at:     t0(),
    }
}

struct FailingEnforcer;

impl FailingEnforcer {
    fn fail() -> EngineResult<()> {
        Err(EngineError::Other(anyhow::anyhow!("enforcement backend unreachable")))
    }
}

impl Enforcer for FailingEnforcer {
    fn block_ip(&self, _: &str, _: Option<Timestamp>) -> EngineResult<()> {
        Self::fail()
    }
    fn block_device(&self, _: &str, _: Option<Timestamp>) -> EngineResult<()> {
        Self::fail()
    }
    fn rate_limit(&self, _: &str, _: u32, _: Option<Timestamp>) -> EngineResult<()> {
        Self::fail()
    }
    fn quarantine(&self, _: &str, _: Option<Timestamp>) -> EngineResult<()> {
        Self::fail()
    }
}

#[test]
fn scenario_c_block_ip_expires_after_twenty_hours() {
    let rig = TestRig::build(t0()).expect("test rig");
    let rule_id = rig
        .store()
        .insert_rule(&severity_gte(4.0, ActionType::BlockIp, 5), t0())
        .expect("insert rule");

    let c = scenario_a_cluster();
    let summary = rig.service.rules.evaluate_cluster(&c);
    assert_eq!(summary.rules_triggered, 1);
    assert_eq!(summary.succeeded, 1);

    let actions = rig.store().defense_actions_for_cluster(&c.id).expect("read actions");
    assert_eq!(actions.len(), 1);
    let action = &actions[0];
    assert_eq!(action.action_type, ActionType::BlockIp);
    assert_eq!(action.target_value, "1.2.3.4");
    assert_eq!(action.triggered_by, "cluster:cluster-a");
    assert_eq!(action.name, "Auto: severity >= 4 block_ip");
    assert_eq!(action.expires_at, Some(t0() + Duration::hours(20)));
    assert!(action.is_active);
    assert_eq!(action.metadata["ruleId"], rule_id.as_str());
    assert_eq!(action.metadata["clusterMetadata"]["primaryIp"], "1.2.3.4");

    let history = rig.store().history_for_cluster(&c.id).expect("read history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result, HistoryResult::Success);
    assert_eq!(history[0].action_id.as_deref(), Some(action.id.as_str()));
    assert_eq!(history[0].duration_seconds, Some(20 * 3600));
    assert_eq!(history[0].impact.cluster_score, 10.0);
    assert_eq!(history[0].impact.rule_severity, 5);

    let row = rig.store().get_rule_row(&rule_id).expect("read rule").unwrap();
    assert_eq!(row.trigger_count, 1);
    assert_eq!(row.last_triggered, Some(t0()));

    let blocks = rig.store().active_enforcement(EnforcementKind::Ip, "1.2.3.4", t0()).expect("read enforcement");
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].until, Some(t0() + Duration::hours(20)));

    assert_eq!(rig.sink.count("defense-action-triggered"), 1);
}

#[test]
fn scenario_d_missing_target_writes_nothing() {
    let rig = TestRig::build(t0()).expect("test rig");
    let rule_id = rig
        .store()
        .insert_rule(&severity_gte(4.0, ActionType::BlockIp, 4), t0())
        .expect("insert rule");

    let c = cluster("no-target", 5, "9.00", PatternType::Velocity, ClusterMetadata::default());
    let summary = rig.service.rules.evaluate_cluster(&c);

    assert_eq!(summary.missing_target, 1);
    assert_eq!(summary.rules_triggered, 0);
    assert_eq!(rig.store().count_defense_actions().expect("count actions"), 0);
    assert_eq!(rig.store().count_history(None).expect("count history"), 0);
    assert_eq!(rig.store().get_rule_row(&rule_id).expect("read rule").unwrap().trigger_count, 0);
    assert!(rig.sink.events().is_empty());
}

#[test]
fn malformed_rules_never_trigger() {
    let rig = TestRig::build(t0()).expect("test rig");
    let store = rig.store();
    store.insert_rule_row(&raw_rule("bad-json", "severity >= 1", "block_ip")).expect("insert rule row");
    store
        .insert_rule_row(&raw_rule("bad-op", r#"{"field":"severity","operator":"lte","value":9}"#, "block_ip"))
        .expect("insert rule row");
    store
        .insert_rule_row(&raw_rule("bad-field", r#"{"field":"ip","operator":"eq","value":"1.2.3.4"}"#, "block_ip"))
        .expect("insert rule row");
    store
        .insert_rule_row(&raw_rule("bad-action", r#"{"field":"severity","operator":"gte","value":1}"#, "nuke"))
        .expect("insert rule row");
    store
        .insert_rule_row(&raw_rule("good", r#"{"field":"severity","operator":"gte","value":1}"#, "alert"))
        .expect("insert rule row");

    let summary = rig.service.rules.evaluate_cluster(&scenario_a_cluster());
    assert_eq!(summary.rules_invalid, 4);
    assert_eq!(summary.rules_evaluated, 1);
    assert_eq!(summary.succeeded, 1);

    let history = store.history_for_cluster("cluster-a").expect("read history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rule_id, "good");
    for id in ["bad-json", "bad-op", "bad-field", "bad-action"] {
        assert_eq!(store.get_rule_row(id).expect("read rule").unwrap().trigger_count, 0, "{id} fired");
    }
}

#[test]
fn enforcement_failure_records_failed_history_and_continues() {
    let rig = TestRig::build_with(t0(), Some(Arc::new(FailingEnforcer)), DefenseConfig::default()).expect("test rig");
    rig.store().insert_rule(&severity_gte(4.0, ActionType::BlockIp, 4), t0()).expect("insert rule");
    rig.store().insert_rule(&severity_gte(5.0, ActionType::Alert, 3), t0()).expect("insert rule");

    let c = scenario_a_cluster();
    let summary = rig.service.rules.evaluate_cluster(&c);
    assert_eq!(summary.rules_triggered, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);

    let history = rig.store().history_for_cluster(&c.id).expect("read history");
    assert_eq!(history.len(), 2);
    let failed = history.iter().find(|h| h.result == HistoryResult::Failed).unwrap();
    assert_eq!(failed.action_id, None);
    assert_eq!(failed.duration_seconds, None);
    let ok = history.iter().find(|h| h.result == HistoryResult::Success).unwrap();
    assert!(ok.action_id.is_some());
    assert_eq!(ok.duration_seconds, None, "alerts never expire");

    assert_eq!(rig.store().count_history(Some(HistoryResult::Failed)).expect("count history"), 1);
    assert_eq!(rig.sink.count("defense-action-triggered"), 1);
    assert_eq!(rig.sink.count("high-risk-cluster"), 1);
}

#[test]
fn default_rules_seed_once_in_severity_order() {
    let rig = TestRig::build(t0()).expect("test rig");
    assert_eq!(rig.service.rules.seed_default_rules().expect("seed rules"), 4);
    assert_eq!(rig.service.rules.seed_default_rules().expect("seed rules"), 0);

    let (rules, invalid) = rig.service.rules.load_active_rules().expect("load rules");
    assert_eq!(invalid, 0);
    let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Critical cluster alert",
            "High severity IP block",
            "Extreme score device block",
            "Velocity rate limit",
        ]
    );
}

#[test]
fn default_rules_against_scenario_a_cluster() {
    let rig = TestRig::build(t0()).expect("test rig");
    rig.service.rules.seed_default_rules().expect("seed rules");

    let c = scenario_a_cluster();
    let summary = rig.service.rules.evaluate_cluster(&c);
    // Alert + IP block fire; the device block matches on score but the
    // cluster has no fingerprint; the velocity rule does not match.
    assert_eq!(summary.rules_evaluated, 4);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.missing_target, 1);

    let actions = rig.store().defense_actions_for_cluster(&c.id).expect("read actions");
    let block = actions.iter().find(|a| a.action_type == ActionType::BlockIp).unwrap();
    assert_eq!(block.expires_at, Some(t0() + Duration::hours(16)));
    let alert = actions.iter().find(|a| a.action_type == ActionType::Alert).unwrap();
    assert_eq!(alert.target_value, c.id);
    assert_eq!(alert.expires_at, None);

    assert_eq!(rig.sink.count("high-risk-cluster"), 1);
    assert_eq!(rig.sink.count("defense-action-triggered"), 2);
}

#[test]
fn rate_limit_applies_severity_cap() {
    let rig = TestRig::build(t0()).expect("test rig");
    rig.store()
        .insert_rule(
            &rule(
                "velocity limit",
                ConditionField::PatternType,
                ConditionOperator::Eq,
                ConditionValue::Text("velocity".into()),
                ActionType::RateLimit,
                2,
            ),
            t0(),
        )
        .expect("insert rule");

    let c = cluster(
        "burst",
        3,
        "5.50",
        PatternType::Velocity,
        ClusterMetadata { primary_ip: Some("198.51.100.7".into()), ..Default::default() },
    );
    rig.service.rules.evaluate_cluster(&c);

    let action = &rig.store().defense_actions_for_cluster("burst").expect("read actions")[0];
    assert_eq!(action.expires_at, Some(t0() + Duration::minutes(60)));
    let limits = rig
        .store()
        .active_enforcement(EnforcementKind::RateLimit, "198.51.100.7", t0())
        .expect("read enforcement");
    assert_eq!(limits[0].requests_per_minute, Some(6));
}

#[test]
fn quarantine_falls_back_to_global_and_never_expires() {
    let rig = TestRig::build(t0()).expect("test rig");
    rig.store()
        .insert_rule(
            &rule(
                "many threats",
                ConditionField::ThreatCount,
                ConditionOperator::Gt,
                ConditionValue::Number(3.0),
                ActionType::Quarantine,
                4,
            ),
            t0(),
        )
        .expect("insert rule");

    let c = scenario_a_cluster();
    rig.service.rules.evaluate_cluster(&c);

    let action = &rig.store().defense_actions_for_cluster(&c.id).expect("read actions")[0];
    assert_eq!(action.target_value, "global");
    assert_eq!(action.expires_at, None);
    assert_eq!(
        rig.store()
            .active_enforcement(EnforcementKind::Merchant, "global", t0() + Duration::days(30))
            .expect("read enforcement")
            .len(),
        1
    );
}

#[test]
fn trigger_count_accumulates_across_clusters() {
    let rig = TestRig::build(t0()).expect("test rig");
    let rule_id = rig
        .store()
        .insert_rule(&severity_gte(1.0, ActionType::Alert, 1), t0())
        .expect("insert rule");

    for i in 0..3 {
        rig.clock.advance(Duration::minutes(5));
        let c = cluster(&format!("c-{i}"), 2, "3.50", PatternType::UserAgent, ClusterMetadata::default());
        rig.service.rules.evaluate_cluster(&c);
    }

    let row = rig.store().get_rule_row(&rule_id).expect("read rule").unwrap();
    assert_eq!(row.trigger_count, 3);
    assert_eq!(row.last_triggered, Some(t0() + Duration::minutes(15)));
    assert_eq!(rig.store().count_history(Some(HistoryResult::Success)).expect("count history"), 3);
}

#[test]
fn inactive_rules_are_not_loaded() {
    let rig = TestRig::build(t0()).expect("test rig");
    let rule_id = rig
        .store()
        .insert_rule(&severity_gte(1.0, ActionType::Alert, 1), t0())
        .expect("insert rule");
    assert!(rig.store().set_rule_active(&rule_id, false).expect("deactivate rule"));

    let summary = rig.service.rules.evaluate_cluster(&scenario_a_cluster());
    assert_eq!(summary.rules_evaluated, 0);
    assert_eq!(rig.store().count_history(None).expect("count history"), 0);

    let all = rig.store().all_rule_rows().expect("read rules");
    assert_eq!(all.len(), 1);
    assert!(!all[0].is_active);
}

#[test]
fn plain_text_metadata_does_not_disable_a_rule() {
    let rig = TestRig::build(t0()).expect("test rig");
    rig.store()
        .insert_rule_row(&ActionRuleRow {
            metadata: "added by on-call after incident".into(),
            ..raw_rule("noted", r#"{"field":"severity","operator":"gte","value":4}"#, "block_ip")
        })
        .expect("insert rule row");

    let summary = rig.service.rules.evaluate_cluster(&scenario_a_cluster());
    assert_eq!(summary.rules_invalid, 0);
    assert_eq!(summary.succeeded, 1);

    let (rules, _) = rig.service.rules.load_active_rules().expect("load rules");
    assert_eq!(rules[0].metadata, "added by on-call after incident");
}

#[test]
fn rule_severity_must_be_one_to_five() {
    let rig = TestRig::build(t0()).expect("test rig");
    let condition = r#"{"field":"severity","operator":"gte","value":4}"#;
    for severity in [0u8, 6, 200] {
        let row = ActionRuleRow { severity, ..raw_rule("out-of-range", condition, "block_ip") };
        assert!(rig.store().insert_rule_row(&row).is_err(), "severity {severity} stored");
    }
    assert!(rig
        .store()
        .insert_rule(&severity_gte(4.0, ActionType::BlockIp, 0), t0())
        .is_err());

    let summary = rig.service.rules.evaluate_cluster(&scenario_a_cluster());
    assert_eq!(summary.rules_evaluated, 0);
    assert_eq!(rig.store().count_defense_actions().expect("count actions"), 0);
}

#[test]
fn unwritable_history_is_counted_separately() {
    let path = std::env::temp_dir().join(format!("defense-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();
    let store = Arc::new(ThreatStore::open(&path).expect("open store"));
    store.migrate().expect("migration");
    store
        .insert_rule(&severity_gte(5.0, ActionType::Alert, 5), t0())
        .expect("insert rule");
    rusqlite::Connection::open(&path)
        .expect("open store")
        .execute_batch("DROP TABLE defense_history;")
        .expect("drop table");

    let rig = TestRig::over_store(store, t0(), None, DefenseConfig::default());
    let summary = rig.service.rules.evaluate_cluster(&scenario_a_cluster());
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.history_failed, 1);
    assert_eq!(rig.store().count_defense_actions().expect("count actions"), 1);

    let _ = std::fs::remove_file(&path);
}
