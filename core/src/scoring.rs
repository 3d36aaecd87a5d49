//! Scoring and time-window helpers shared by every detector.
//!
//! Scores live on a 0.0–10.0 scale. Severity is 1–5 and is derived from
//! score OR member count, whichever pushes it higher.

use crate::threat::{ClusterCandidate, ThreatEvent};

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;

/// Universal persistence gate, applied after detector-local thresholds.
pub const SIGNIFICANT_SCORE:   f64   = 3.0;
pub const SIGNIFICANT_MEMBERS: usize = 2;

/// One step of a time-proximity bonus table: a span strictly below
/// `under_ms` earns `bonus`. Tables are ordered tightest first.
#[derive(Debug, Clone, Copy)]
pub struct ProximityStep {
    pub under_ms: i64,
    pub bonus:    f64,
}

pub const fn step(under_ms: i64, bonus: f64) -> ProximityStep {
    ProximityStep { under_ms, bonus }
}

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS:   i64 = 60 * MINUTE_MS;

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return MIN_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Severity mapping. Either condition alone can raise the level.
pub fn severity_for(score: f64, members: usize) -> u8 {
    if score >= 8.0 || members >= 10 {
        5
    } else if score >= 6.0 || members >= 7 {
        4
    } else if score >= 4.0 || members >= 5 {
        3
    } else if score >= 2.0 || members >= 3 {
        2
    } else {
        1
    }
}

/// max − min timestamp across the events, in milliseconds.
pub fn time_span_ms(events: &[ThreatEvent]) -> i64 {
    let mut stamps = events.iter().filter_map(|e| e.timestamp).map(|t| t.timestamp_millis());
    let first = match stamps.next() {
        Some(t) => t,
        None => return 0,
    };
    let (lo, hi) = stamps.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
    hi - lo
}

/// First matching bonus in `table`, or 0.
pub fn proximity_bonus(span_ms: i64, table: &[ProximityStep]) -> f64 {
    table
        .iter()
        .find(|s| span_ms < s.under_ms)
        .map(|s| s.bonus)
        .unwrap_or(0.0)
}

/// True when every event carries the same single threat type.
pub fn single_threat_type(events: &[ThreatEvent]) -> bool {
    match events.split_first() {
        Some((head, rest)) => rest.iter().all(|e| e.threat_type == head.threat_type),
        None => false,
    }
}

pub fn is_significant(candidate: &ClusterCandidate) -> bool {
    is_significant_with(candidate, SIGNIFICANT_SCORE, SIGNIFICANT_MEMBERS)
}

pub fn is_significant_with(candidate: &ClusterCandidate, min_score: f64, min_members: usize) -> bool {
    candidate.score >= min_score && candidate.member_count() >= min_members
}
