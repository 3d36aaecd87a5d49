//! Clustering detectors.
//!
//! Each detector reads the same immutable batch of dated events and returns
//! zero or more candidates. Detectors never touch the store; persistence and
//! the universal significance gate belong to the cluster engine.

pub mod device;
pub mod ip;
pub mod user_agent;
pub mod velocity;

use crate::threat::{ClusterCandidate, ThreatEvent};
use std::collections::BTreeMap;

/// Run every detector in fixed order: ip, device, velocity, user agent.
pub fn run_all(events: &[ThreatEvent]) -> Vec<ClusterCandidate> {
    let mut candidates = ip::detect(events);
    candidates.extend(device::detect(events));
    candidates.extend(velocity::detect(events));
    candidates.extend(user_agent::detect(events));
    candidates
}

/// Group events by an optional string key. Events without a key are skipped.
/// BTreeMap keeps candidate order stable across identical passes.
pub(crate) fn group_by<F>(events: &[ThreatEvent], key: F) -> BTreeMap<String, Vec<ThreatEvent>>
where
    F: Fn(&ThreatEvent) -> Option<String>,
{
    let mut groups: BTreeMap<String, Vec<ThreatEvent>> = BTreeMap::new();
    for event in events {
        if let Some(k) = key(event) {
            groups.entry(k).or_default().push(event.clone());
        }
    }
    groups
}
