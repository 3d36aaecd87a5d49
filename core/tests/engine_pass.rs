//! Full passes: watermark, re-entrancy, manual trigger, notifications,
//! operator report and the periodic scheduler.

use chrono::{Duration, TimeZone, Utc};
use defense_core::{
    clock::{Clock, ManualClock},
    cluster_engine::PassOutcome,
    config::DefenseConfig,
    event::DefenseEvent,
    notify::{MemorySink, NotificationSink},
    report::OperatorReport,
    rule::ActionType,
    scheduler,
    service::{DefenseService, TestRig},
    store::ThreatStore,
    threat::ThreatEvent,
    types::Timestamp,
};
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn from_ip(ip: &str, at: Timestamp) -> ThreatEvent {
    ThreatEvent {
        id: 0,
        ip_address: Some(ip.into()),
        user_agent: None,
        device_fingerprint: None,
        merchant_id: Some("m-42".into()),
        timestamp: Some(at),
        threat_type: "card_testing".into(),
        metadata: serde_json::json!({ "amount": 1 }),
    }
}

fn insert_burst(store: &ThreatStore, ip: &str, start: Timestamp) {
    for i in 0..5 {
        store.insert_threat_event(&from_ip(ip, start + Duration::seconds(i * 4))).expect("insert event");
    }
}

fn completed(outcome: PassOutcome) -> defense_core::cluster_engine::PassReport {
    match outcome {
        PassOutcome::Completed(r) => r,
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn watermark_moves_to_pass_end() {
    init_logging();
    let rig = TestRig::build(t0()).expect("test rig");
    assert_eq!(rig.service.engine.watermark(), t0() - Duration::hours(1));

    insert_burst(rig.store(), "1.2.3.4", t0() - Duration::minutes(2));
    let first = completed(rig.service.engine.analyze_threats());
    assert_eq!(first.cluster_ids.len(), 1);
    assert_eq!(rig.service.engine.watermark(), t0());

    // Nothing new: the same events are not analysed again.
    rig.clock.advance(Duration::minutes(5));
    let second = completed(rig.service.engine.analyze_threats());
    assert_eq!(second.threats_analyzed, 0);
    assert_eq!(rig.store().count_clusters().expect("count clusters"), 1);

    // Late arrivals stamped before the watermark are never picked up.
    insert_burst(rig.store(), "4.4.4.4", t0() - Duration::minutes(1));
    insert_burst(rig.store(), "5.5.5.5", t0() + Duration::minutes(6));
    rig.clock.advance(Duration::minutes(5));
    let third = completed(rig.service.engine.analyze_threats());
    assert_eq!(third.threats_analyzed, 5);
    assert_eq!(rig.store().count_clusters().expect("count clusters"), 2);
}

#[test]
fn failed_pass_still_advances_watermark() {
    init_logging();
    let path = std::env::temp_dir().join(format!("defense-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();

    let store = Arc::new(ThreatStore::open(&path).expect("open store"));
    store.migrate().expect("migration");
    insert_burst(&store, "1.2.3.4", t0() - Duration::minutes(2));
    rusqlite::Connection::open(&path)
        .expect("open store")
        .execute_batch("DROP TABLE cluster_pattern;")
        .expect("drop table");

    let rig = TestRig::over_store(store, t0(), None, DefenseConfig::default());
    rig.clock.advance(Duration::seconds(30));
    match rig.service.engine.analyze_threats() {
        PassOutcome::Failed { error, .. } => assert!(error.contains("cluster_pattern"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(rig.service.engine.watermark(), t0() + Duration::seconds(30));
    assert!(!rig.service.engine.is_running());
    // The cluster insert rolled back with its patterns.
    assert_eq!(rig.store().count_clusters().expect("count clusters"), 0);

    let _ = std::fs::remove_file(&path);
}

/// Blocks the first emit until released, so a pass can be held in flight.
struct GateSink {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
    inner:   MemorySink,
}

impl NotificationSink for GateSink {
    fn emit(&self, event: &DefenseEvent) -> anyhow::Result<()> {
        let entered = self.entered.lock().take();
        if let Some(tx) = entered {
            tx.send(()).ok();
            self.release.lock().recv().ok();
        }
        self.inner.emit(event)
    }
}

#[test]
fn overlapping_pass_is_skipped_without_duplicates() {
    init_logging();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let sink = Arc::new(GateSink {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
        inner:   MemorySink::new(),
    });

    let store = Arc::new(ThreatStore::in_memory().expect("in-memory store"));
    store.migrate().expect("migration");
    insert_burst(&store, "1.2.3.4", t0() - Duration::minutes(2));
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
    let service = DefenseService::build(store.clone(), sink.clone(), clock, DefenseConfig::default());

    let engine = service.engine.clone();
    let first = std::thread::spawn(move || engine.analyze_threats());

    entered_rx.recv().expect("channel");
    assert!(service.engine.is_running());
    assert_eq!(service.engine.analyze_threats(), PassOutcome::Skipped);
    let manual = service.engine.trigger_manual_analysis();
    assert!(manual.error.is_some());

    release_tx.send(()).expect("channel");
    let report = completed(first.join().expect("pass thread"));
    assert_eq!(report.cluster_ids.len(), 1);
    assert_eq!(store.count_clusters().expect("count clusters"), 1);
    assert!(!service.engine.is_running());
    assert_eq!(sink.inner.count("new-fraud-cluster"), 1);
}

#[test]
fn manual_trigger_reports_yield() {
    init_logging();
    let rig = TestRig::build(t0()).expect("test rig");
    insert_burst(rig.store(), "1.2.3.4", t0() - Duration::minutes(3));
    insert_burst(rig.store(), "9.9.9.9", t0() - Duration::minutes(40));

    let report = rig.service.engine.trigger_manual_analysis();
    assert_eq!(report.error, None);
    assert_eq!(report.threats_analyzed, 10);
    assert_eq!(report.clusters_found, 2);

    let json = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["clustersFound"], 2);
    assert_eq!(json["threatsAnalyzed"], 10);
}

#[test]
fn manual_window_is_clamped() {
    init_logging();
    let rig = TestRig::build(t0()).expect("test rig");
    for i in 0..12 {
        rig.store()
            .insert_threat_event(&from_ip(&format!("203.0.113.{i}"), t0() - Duration::minutes(i * 2)))
            .expect("insert event");
    }

    let report = rig.service.engine.trigger_manual_analysis_window(3);
    assert_eq!(report.threats_analyzed, 3);
    assert_eq!(report.pass.unwrap().threats_analyzed, 3);

    let rig = TestRig::build(t0()).expect("test rig");
    rig.store().insert_threat_event(&from_ip("1.1.1.1", t0() - Duration::minutes(1))).expect("insert event");
    rig.store().insert_threat_event(&from_ip("1.1.1.2", t0() - Duration::minutes(2))).expect("insert event");
    assert_eq!(rig.service.engine.trigger_manual_analysis_window(0).threats_analyzed, 1);
}

#[test]
fn notifications_follow_rule_execution() {
    init_logging();
    let rig = TestRig::build(t0()).expect("test rig");
    rig.service.rules.seed_default_rules().expect("seed rules");
    insert_burst(rig.store(), "1.2.3.4", t0() - Duration::minutes(1));

    completed(rig.service.engine.analyze_threats());

    let names: Vec<&str> = rig.sink.events().iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec![
            "high-risk-cluster",
            "defense-action-triggered",
            "defense-action-triggered",
            "new-fraud-cluster",
        ]
    );

    let events = rig.sink.events();
    let json = serde_json::to_value(events.last().unwrap()).expect("serialize");
    assert_eq!(json["event"], "new-fraud-cluster");
    assert_eq!(json["severity"], 5);
    assert_eq!(json["score"], 10.0);
    assert_eq!(json["matchedThreatCount"], 5);
    assert_eq!(json["patternType"], "ip_based");
}

struct BrokenSink;

impl NotificationSink for BrokenSink {
    fn emit(&self, _: &DefenseEvent) -> anyhow::Result<()> {
        anyhow::bail!("socket closed")
    }
}

#[test]
fn broken_notification_channel_does_not_affect_pass() {
    init_logging();
    let store = Arc::new(ThreatStore::in_memory().expect("in-memory store"));
    store.migrate().expect("migration");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
    let service = DefenseService::build(store.clone(), Arc::new(BrokenSink), clock, DefenseConfig::default());
    service.rules.seed_default_rules().expect("seed rules");
    insert_burst(&store, "1.2.3.4", t0() - Duration::minutes(1));

    let report = completed(service.engine.analyze_threats());
    assert_eq!(report.cluster_ids.len(), 1);
    assert_eq!(report.evaluations.succeeded, 2);
    assert_eq!(store.count_defense_actions().expect("count actions"), 2);
}

#[test]
fn operator_report_summarises_manual_pass() {
    init_logging();
    let rig = TestRig::build(t0()).expect("test rig");
    let rules_created = rig.service.rules.seed_default_rules().expect("seed rules");
    insert_burst(rig.store(), "1.2.3.4", t0() - Duration::minutes(1));
    rig.store()
        .insert_threat_event(&from_ip("10.1.1.1", t0() - Duration::minutes(30)))
        .expect("insert event");

    let manual = rig.service.engine.trigger_manual_analysis();
    let report = OperatorReport::build(rig.store(), &manual, t0(), rules_created, t0()).expect("report");

    assert_eq!(report.threats_analyzed, 6);
    assert_eq!(report.clusters_created, 1);
    assert_eq!(report.blocked, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.ignored, 1);
    assert_eq!(report.rules_created, 4);
    assert_eq!(report.rules_triggered, 2);
    assert_eq!(report.top_clusters.len(), 1);
    assert_eq!(report.top_clusters[0].actions, vec![ActionType::Alert, ActionType::BlockIp]);
    assert_eq!(report.active_actions.len(), 2);

    let text = report.to_string();
    assert!(text.contains("=== ANALYSIS SUMMARY ==="));
    assert!(text.contains("1.2.3.4"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_runs_first_pass_immediately_and_stops_on_signal() {
    init_logging();
    let rig = TestRig::build(t0()).expect("test rig");
    insert_burst(rig.store(), "1.2.3.4", t0() - Duration::minutes(1));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler::run_periodic(
        rig.service.engine.clone(),
        std::time::Duration::from_secs(3600),
        rx,
    ));

    let mut clusters = 0;
    for _ in 0..100 {
        clusters = rig.store().count_clusters().expect("count clusters");
        if clusters > 0 && !rig.service.engine.is_running() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(clusters, 1);

    tx.send(true).expect("channel");
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .expect("scheduler task");
    assert_eq!(rig.store().count_clusters().expect("count clusters"), 1);
}
