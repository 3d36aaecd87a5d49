//! User-agent clustering.
//!
//! UA strings are normalised (digit runs → `N`, whitespace collapsed) and
//! hashed to a short signature so minor version bumps land in one group.
//! Shared UAs are common, so the minimum group size is 3 and the emit
//! threshold is 3.5.

use crate::scoring;
use crate::threat::{ClusterCandidate, PatternType, ThreatEvent};
use sha2::{Digest, Sha256};

const MIN_EVENTS:      usize = 3;
const PER_EVENT:       f64   = 1.0;
const AUTOMATION_BONUS: f64  = 2.0;
const SHORT_UA_LEN:    usize = 20;
const SHORT_UA_BONUS:  f64   = 1.5;
const MIN_SCORE:       f64   = 3.5;

/// Case-sensitive on purpose; "Bot" or "Crawler" do not match.
const AUTOMATION_MARKERS: &[&str] = &["bot", "crawler"];

pub fn detect(events: &[ThreatEvent]) -> Vec<ClusterCandidate> {
    super::group_by(events, |e| e.user_agent.as_deref().map(signature))
        .into_iter()
        .filter(|(_, group)| group.len() >= MIN_EVENTS)
        .filter_map(|(sig, group)| {
            let raw = group[0].user_agent.clone().unwrap_or_default();
            let mut score = group.len() as f64 * PER_EVENT;
            if AUTOMATION_MARKERS.iter().any(|m| raw.contains(m)) {
                score += AUTOMATION_BONUS;
            }
            if raw.chars().count() < SHORT_UA_LEN {
                score += SHORT_UA_BONUS;
            }
            let score = scoring::clamp_score(score);
            if score < MIN_SCORE {
                return None;
            }

            Some(ClusterCandidate {
                label:        format!("Shared user agent {sig} ({} threats)", group.len()),
                severity:     scoring::severity_for(score, group.len()),
                pattern_type: PatternType::UserAgent,
                events:       group,
                score,
            })
        })
        .collect()
}

/// Replace digit runs with a placeholder and collapse whitespace.
pub fn normalize(user_agent: &str) -> String {
    let mut out = String::with_capacity(user_agent.len());
    let mut in_digits = false;
    for c in user_agent.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('N');
            }
            in_digits = true;
        } else {
            in_digits = false;
            out.push(c);
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First 8 bytes of SHA-256 over the normalised string, hex encoded.
pub fn signature(user_agent: &str) -> String {
    let mut h = Sha256::new();
    h.update(normalize(user_agent).as_bytes());
    hex::encode(&h.finalize()[..8])
}
