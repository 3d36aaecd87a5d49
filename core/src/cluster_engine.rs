//! ThreatClusterEngine: one analysis pass over recent fraud signals.
//!
//! RULE: At most one pass runs at a time. A pass that finds another in
//!       flight returns `Skipped` immediately; it is dropped, not queued.
//! RULE: The watermark advances when a pass ends, whether it succeeded or
//!       not. A failed pass does not retry its window; the loss is logged.
//!
//! Pass order:
//!   1. Fetch dated events since the watermark, newest first, capped
//!   2. Run the detectors (ip, device, velocity, user agent)
//!   3. Keep significant candidates only
//!   4. Per candidate: persist cluster + patterns, evaluate rules, notify

use crate::{
    clock::Clock,
    config::DefenseConfig,
    detectors,
    error::EngineResult,
    event::DefenseEvent,
    notify::{self, NotificationSink},
    rule_engine::{ActionRuleEngine, EvaluationSummary},
    scoring,
    store::ThreatStore,
    threat::{format_score, ClusterCandidate, ClusterPattern, FraudCluster, ThreatEvent},
    types::{new_entity_id, EntityId, EventId, Timestamp},
};
use chrono::Duration;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Largest window an operator may request for a manual pass.
pub const MAX_MANUAL_WINDOW: usize = 200;

// ── Outcomes ─────────────────────────────────────────────────────────────────

/// What a completed pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub started_at:       Timestamp,
    pub threats_analyzed: usize,
    pub candidates_found: usize,
    pub cluster_ids:      Vec<EntityId>,
    /// Distinct events that ended up in at least one persisted cluster.
    pub clustered_events: BTreeSet<EventId>,
    pub evaluations:      EvaluationSummary,
}

impl PassReport {
    fn new(started_at: Timestamp) -> Self {
        Self { started_at, ..Default::default() }
    }

    pub fn events_ignored(&self) -> usize {
        self.threats_analyzed.saturating_sub(self.clustered_events.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Another pass was already running.
    Skipped,
    Completed(PassReport),
    Failed { started_at: Timestamp, error: String },
}

/// Result of an operator-triggered pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualAnalysisReport {
    pub clusters_found:   i64,
    pub threats_analyzed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:            Option<String>,
    #[serde(skip)]
    pub pass:             Option<PassReport>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Clears the running flag when the pass ends, including on unwind.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ThreatClusterEngine {
    store:     Arc<ThreatStore>,
    rules:     Arc<ActionRuleEngine>,
    sink:      Arc<dyn NotificationSink>,
    clock:     Arc<dyn Clock>,
    config:    DefenseConfig,
    running:   AtomicBool,
    watermark: Mutex<Timestamp>,
}

impl ThreatClusterEngine {
    pub fn new(
        store: Arc<ThreatStore>,
        rules: Arc<ActionRuleEngine>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: DefenseConfig,
    ) -> Self {
        let watermark = clock.now() - Duration::seconds(config.initial_lookback_secs.max(0));
        Self {
            store,
            rules,
            sink,
            clock,
            config,
            running: AtomicBool::new(false),
            watermark: Mutex::new(watermark),
        }
    }

    pub fn config(&self) -> &DefenseConfig {
        &self.config
    }

    pub fn rule_engine(&self) -> &Arc<ActionRuleEngine> {
        &self.rules
    }

    /// Lower bound of the next pass's fetch.
    pub fn watermark(&self) -> Timestamp {
        *self.watermark.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One scheduled pass with the configured fetch cap.
    pub fn analyze_threats(&self) -> PassOutcome {
        self.analyze_threats_with_limit(self.config.fetch_limit)
    }

    pub fn analyze_threats_with_limit(&self, limit: usize) -> PassOutcome {
        let _guard = match self.try_begin() {
            Some(g) => g,
            None => {
                log::info!("analysis pass already in flight; skipping");
                return PassOutcome::Skipped;
            }
        };

        let started_at = self.clock.now();
        let since = self.watermark();
        let outcome = match self.run_pass(since, started_at, limit) {
            Ok(report) => {
                if report.threats_analyzed > 0 {
                    log::info!(
                        "analysis pass: {} events, {} candidates, {} clusters, {} actions ({} failed)",
                        report.threats_analyzed,
                        report.candidates_found,
                        report.cluster_ids.len(),
                        report.evaluations.succeeded,
                        report.evaluations.failed
                    );
                }
                if report.evaluations.history_failed > 0 {
                    log::error!(
                        "analysis pass: {} defense history row(s) could not be written",
                        report.evaluations.history_failed
                    );
                }
                PassOutcome::Completed(report)
            }
            Err(e) => {
                log::error!(
                    "analysis pass failed: {e}; events since {} will not be re-analysed",
                    since.to_rfc3339()
                );
                PassOutcome::Failed { started_at, error: e.to_string() }
            }
        };

        *self.watermark.lock() = self.clock.now();
        outcome
    }

    /// Operator-triggered pass over the configured fetch cap.
    pub fn trigger_manual_analysis(&self) -> ManualAnalysisReport {
        self.manual_pass(self.config.fetch_limit)
    }

    /// Operator-triggered pass over at most `window` events (1–200).
    pub fn trigger_manual_analysis_window(&self, window: usize) -> ManualAnalysisReport {
        self.manual_pass(window.clamp(1, MAX_MANUAL_WINDOW))
    }

    fn manual_pass(&self, limit: usize) -> ManualAnalysisReport {
        let started_at = self.clock.now();
        let threats_analyzed = match self.store.count_events_since(self.watermark()) {
            Ok(n) => n.min(limit as i64),
            Err(e) => {
                log::error!("manual analysis: cannot count pending events: {e}");
                return ManualAnalysisReport {
                    clusters_found:   0,
                    threats_analyzed: 0,
                    error:            Some(e.to_string()),
                    pass:             None,
                };
            }
        };

        let (error, pass) = match self.analyze_threats_with_limit(limit) {
            PassOutcome::Completed(report) => (None, Some(report)),
            PassOutcome::Skipped => (Some("an analysis pass is already running".to_string()), None),
            PassOutcome::Failed { error, .. } => (Some(error), None),
        };

        let clusters_found = match self.store.count_clusters_since(started_at) {
            Ok(n) => n,
            Err(e) => {
                log::error!("manual analysis: cannot count new clusters: {e}");
                0
            }
        };

        ManualAnalysisReport { clusters_found, threats_analyzed, error, pass }
    }

    fn try_begin(&self) -> Option<PassGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(&self.running))
    }

    fn run_pass(&self, since: Timestamp, started_at: Timestamp, limit: usize) -> EngineResult<PassReport> {
        let mut report = PassReport::new(started_at);

        let events: Vec<ThreatEvent> = self
            .store
            .fetch_events_since(since, limit)?
            .into_iter()
            .filter(|e| e.timestamp.is_some())
            .collect();
        if events.is_empty() {
            log::debug!("no new events since {}", since.to_rfc3339());
            return Ok(report);
        }
        report.threats_analyzed = events.len();

        let candidates = detectors::run_all(&events);
        report.candidates_found = candidates.len();

        for candidate in candidates.into_iter().filter(|c| {
            scoring::is_significant_with(c, self.config.min_cluster_score, self.config.min_cluster_members)
        }) {
            let cluster = self.persist(&candidate)?;
            report.clustered_events.extend(candidate.events.iter().map(|e| e.id));

            let summary = self.rules.evaluate_cluster(&cluster);
            report.evaluations.absorb(&summary);

            notify::deliver(
                self.sink.as_ref(),
                &DefenseEvent::NewFraudCluster {
                    cluster_id:           cluster.id.clone(),
                    title:                cluster.label.clone(),
                    severity:             cluster.severity,
                    score:                candidate.score,
                    matched_threat_count: cluster.threat_count,
                    timestamp:            cluster.created_at,
                    pattern_type:         cluster.pattern_type,
                },
            );
            report.cluster_ids.push(cluster.id);
        }

        Ok(report)
    }

    fn persist(&self, candidate: &ClusterCandidate) -> EngineResult<FraudCluster> {
        let cluster = FraudCluster {
            id:           new_entity_id(),
            label:        candidate.label.clone(),
            score:        format_score(candidate.score),
            severity:     candidate.severity,
            threat_count: candidate.member_count(),
            pattern_type: candidate.pattern_type,
            metadata:     candidate.metadata(),
            created_at:   self.clock.now(),
        };
        let patterns: Vec<ClusterPattern> = candidate
            .events
            .iter()
            .map(|e| ClusterPattern::snapshot(&cluster.id, e))
            .collect();
        self.store.insert_cluster_with_patterns(&cluster, &patterns)?;
        log::debug!("persisted cluster {} '{}' score {}", cluster.id, cluster.label, cluster.score);
        Ok(cluster)
    }
}
