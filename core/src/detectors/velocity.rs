//! Velocity clustering: bursts of events inside a 5-minute forward window.
//!
//! Every event anchors its own window over the chronologically sorted batch,
//! so windows overlap and one event can belong to several candidates. This
//! favours recall; no maximal-window dedup is performed.

use crate::scoring::{self, MINUTE_MS};
use crate::threat::{ClusterCandidate, PatternType, ThreatEvent};

const WINDOW_MINUTES:   i64   = 5;
const WINDOW_MS:        i64   = WINDOW_MINUTES * MINUTE_MS;
const MIN_EVENTS:       usize = 3;
const RATE_WEIGHT:      f64   = 2.0;
const HIGH_RATE:        f64   = 5.0; // events per minute
const HIGH_RATE_BONUS:  f64   = 3.0;
const RAISED_RATE:      f64   = 2.0;
const RAISED_RATE_BONUS: f64  = 1.5;
const MIN_SCORE:        f64   = 4.0;

pub fn detect(events: &[ThreatEvent]) -> Vec<ClusterCandidate> {
    let mut sorted: Vec<&ThreatEvent> = events.iter().filter(|e| e.timestamp.is_some()).collect();
    sorted.sort_by_key(|e| (e.millis(), e.id));

    let mut candidates = Vec::new();
    for (start, anchor) in sorted.iter().enumerate() {
        let window_end = anchor.millis() + WINDOW_MS;
        let members: Vec<ThreatEvent> = sorted[start..]
            .iter()
            .take_while(|e| e.millis() <= window_end)
            .map(|e| (*e).clone())
            .collect();

        if members.len() < MIN_EVENTS {
            continue;
        }

        let rate = members.len() as f64 / WINDOW_MINUTES as f64;
        let mut score = rate * RATE_WEIGHT;
        if rate >= HIGH_RATE {
            score += HIGH_RATE_BONUS;
        } else if rate >= RAISED_RATE {
            score += RAISED_RATE_BONUS;
        }
        let score = scoring::clamp_score(score);
        if score < MIN_SCORE {
            continue;
        }

        candidates.push(ClusterCandidate {
            label: format!(
                "Velocity burst: {} threats in {WINDOW_MINUTES} min ({rate:.1}/min)",
                members.len()
            ),
            severity:     scoring::severity_for(score, members.len()),
            pattern_type: PatternType::Velocity,
            events:       members,
            score,
        });
    }
    candidates
}
