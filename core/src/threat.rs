//! Fraud signal events and the clusters built from them.
//!
//! ThreatEvent is read-only analysis input. ClusterCandidate lives for one
//! pass. FraudCluster and ClusterPattern are what a pass persists.

use crate::{
    error::{EngineError, EngineResult},
    types::{EntityId, EventId, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Similarity recorded on every cluster membership link.
pub const MEMBER_SIMILARITY: f64 = 95.0;

// ── Events ───────────────────────────────────────────────────────────────────

/// A stored fraud signal. Events without a timestamp never reach a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    #[serde(default)]
    pub id: EventId,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    pub threat_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ThreatEvent {
    /// Millisecond timestamp, or 0 for an undated event.
    pub fn millis(&self) -> i64 {
        self.timestamp.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

// ── Pattern types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    IpBased,
    DeviceFingerprint,
    Velocity,
    UserAgent,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpBased           => "ip_based",
            Self::DeviceFingerprint => "device_fingerprint",
            Self::Velocity          => "velocity",
            Self::UserAgent         => "user_agent",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "ip_based"           => Ok(Self::IpBased),
            "device_fingerprint" => Ok(Self::DeviceFingerprint),
            "velocity"           => Ok(Self::Velocity),
            "user_agent"         => Ok(Self::UserAgent),
            other => Err(EngineError::UnknownTag {
                kind:  "pattern type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Candidates ───────────────────────────────────────────────────────────────

/// A group of events proposed by one detector during one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCandidate {
    pub events:       Vec<ThreatEvent>,
    pub score:        f64,
    pub pattern_type: PatternType,
    pub label:        String,
    pub severity:     u8,
}

impl ClusterCandidate {
    pub fn member_count(&self) -> usize {
        self.events.len()
    }

    /// Summarise the member events into the persisted metadata document.
    pub fn metadata(&self) -> ClusterMetadata {
        ClusterMetadata::from_events(self.pattern_type, &self.events)
    }
}

// ── Persisted clusters ───────────────────────────────────────────────────────

/// Cluster metadata. One canonical field per attribute; the dominant
/// ip / device / merchant among the members is what rule targets resolve to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    pub pattern_type:       Option<PatternType>,
    #[serde(default)]
    pub event_ids:          Vec<EventId>,
    #[serde(default)]
    pub time_span_ms:       i64,
    #[serde(default)]
    pub unique_ips:         usize,
    #[serde(default)]
    pub unique_devices:     usize,
    #[serde(default)]
    pub threat_types:       BTreeSet<String>,
    #[serde(default)]
    pub primary_ip:         Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    #[serde(default)]
    pub merchant_id:        Option<String>,
}

impl ClusterMetadata {
    pub fn from_events(pattern_type: PatternType, events: &[ThreatEvent]) -> Self {
        let ips: Vec<&str> = events.iter().filter_map(|e| e.ip_address.as_deref()).collect();
        let devices: Vec<&str> = events
            .iter()
            .filter_map(|e| e.device_fingerprint.as_deref())
            .collect();
        let merchants: Vec<&str> = events.iter().filter_map(|e| e.merchant_id.as_deref()).collect();

        Self {
            pattern_type:       Some(pattern_type),
            event_ids:          events.iter().map(|e| e.id).collect(),
            time_span_ms:       crate::scoring::time_span_ms(events),
            unique_ips:         ips.iter().collect::<BTreeSet<_>>().len(),
            unique_devices:     devices.iter().collect::<BTreeSet<_>>().len(),
            threat_types:       events.iter().map(|e| e.threat_type.clone()).collect(),
            primary_ip:         dominant(&ips),
            device_fingerprint: dominant(&devices),
            merchant_id:        dominant(&merchants),
        }
    }
}

/// Most frequent value; ties go to the lexicographically smallest.
fn dominant(values: &[&str]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(*v).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map(|(_, c)| count > c).unwrap_or(true) {
            best = Some((value, count));
        }
    }
    best.map(|(v, _)| v.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudCluster {
    pub id:           EntityId,
    pub label:        String,
    /// Decimal string, two places.
    pub score:        String,
    pub severity:     u8,
    pub threat_count: usize,
    pub pattern_type: PatternType,
    pub metadata:     ClusterMetadata,
    pub created_at:   Timestamp,
}

impl FraudCluster {
    pub fn score_value(&self) -> EngineResult<f64> {
        self.score.trim().parse::<f64>().map_err(|_| EngineError::InvalidScore {
            cluster_id: self.id.clone(),
            raw:        self.score.clone(),
        })
    }
}

pub fn format_score(score: f64) -> String {
    format!("{score:.2}")
}

/// Membership link between a cluster and one of its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPattern {
    pub cluster_id:         EntityId,
    pub event_id:           EventId,
    pub ip_address:         Option<String>,
    pub user_agent:         Option<String>,
    pub device_fingerprint: Option<String>,
    pub timestamp:          Option<Timestamp>,
    pub similarity:         f64,
}

impl ClusterPattern {
    pub fn snapshot(cluster_id: &str, event: &ThreatEvent) -> Self {
        Self {
            cluster_id:         cluster_id.to_string(),
            event_id:           event.id,
            ip_address:         event.ip_address.clone(),
            user_agent:         event.user_agent.clone(),
            device_fingerprint: event.device_fingerprint.clone(),
            timestamp:          event.timestamp,
            similarity:         MEMBER_SIMILARITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_prefers_frequency_then_order() {
        assert_eq!(dominant(&["b", "a", "b"]), Some("b".to_string()));
        assert_eq!(dominant(&["b", "a"]), Some("a".to_string()));
        assert_eq!(dominant(&[]), None);
    }

    #[test]
    fn metadata_uses_camel_case_keys() {
        let meta = ClusterMetadata {
            pattern_type: Some(PatternType::Velocity),
            primary_ip:   Some("1.2.3.4".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["patternType"], "velocity");
        assert_eq!(json["primaryIp"], "1.2.3.4");
    }
}
