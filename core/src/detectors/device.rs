//! Device-fingerprint clustering.
//!
//! Same grouping as the IP detector, keyed on device fingerprint, with a
//! steeper per-event weight and tighter time bonuses: a shared fingerprint
//! is stronger evidence than a shared address.

use crate::scoring::{self, step, ProximityStep, MINUTE_MS, SECOND_MS};
use crate::threat::{ClusterCandidate, PatternType, ThreatEvent};

const MIN_EVENTS: usize = 2;
const PER_EVENT:  f64   = 2.0;

const PROXIMITY: [ProximityStep; 3] = [
    step(30 * SECOND_MS, 4.0),
    step(2 * MINUTE_MS,  2.5),
    step(10 * MINUTE_MS, 1.0),
];

pub fn detect(events: &[ThreatEvent]) -> Vec<ClusterCandidate> {
    super::group_by(events, |e| e.device_fingerprint.clone())
        .into_iter()
        .filter(|(_, group)| group.len() >= MIN_EVENTS)
        .map(|(fingerprint, group)| {
            let span = scoring::time_span_ms(&group);
            let score = scoring::clamp_score(
                group.len() as f64 * PER_EVENT + scoring::proximity_bonus(span, &PROXIMITY),
            );

            ClusterCandidate {
                label:        format!("Shared device {} ({} threats)", short(&fingerprint), group.len()),
                severity:     scoring::severity_for(score, group.len()),
                pattern_type: PatternType::DeviceFingerprint,
                events:       group,
                score,
            }
        })
        .collect()
}

fn short(fingerprint: &str) -> &str {
    match fingerprint.char_indices().nth(12) {
        Some((idx, _)) => &fingerprint[..idx],
        None => fingerprint,
    }
}
