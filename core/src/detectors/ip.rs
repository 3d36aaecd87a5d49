//! IP-based clustering: events sharing an exact source address.
//!
//! score = count × 1.5 + time-proximity bonus + 1.5 when every event
//! carries the same threat type. Shared IPs can be legitimate (NAT),
//! so this is the mildest of the grouping detectors.

use crate::scoring::{self, step, ProximityStep, HOUR_MS, MINUTE_MS};
use crate::threat::{ClusterCandidate, PatternType, ThreatEvent};

const MIN_EVENTS:        usize = 2;
const PER_EVENT:         f64   = 1.5;
const HOMOGENEOUS_BONUS: f64   = 1.5;

const PROXIMITY: [ProximityStep; 3] = [
    step(MINUTE_MS,     3.0),
    step(5 * MINUTE_MS, 2.0),
    step(HOUR_MS,       1.0),
];

pub fn detect(events: &[ThreatEvent]) -> Vec<ClusterCandidate> {
    super::group_by(events, |e| e.ip_address.clone())
        .into_iter()
        .filter(|(_, group)| group.len() >= MIN_EVENTS)
        .map(|(ip, group)| {
            let span = scoring::time_span_ms(&group);
            let mut score = group.len() as f64 * PER_EVENT;
            score += scoring::proximity_bonus(span, &PROXIMITY);
            if scoring::single_threat_type(&group) {
                score += HOMOGENEOUS_BONUS;
            }
            let score = scoring::clamp_score(score);
            log::debug!("ip cluster {ip}: {} events, span {span}ms, score {score:.2}", group.len());

            ClusterCandidate {
                label:        format!("Shared IP {ip} ({} threats)", group.len()),
                severity:     scoring::severity_for(score, group.len()),
                pattern_type: PatternType::IpBased,
                events:       group,
                score,
            }
        })
        .collect()
}
