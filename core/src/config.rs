//! Engine configuration, loaded from JSON. Every field has a default, so a
//! partial file (or none at all) is valid.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenseConfig {
    /// Seconds between scheduled passes.
    pub analysis_interval_secs: u64,
    /// Row cap on a single pass's event fetch.
    pub fetch_limit:            usize,
    /// How far back the first pass looks.
    pub initial_lookback_secs:  i64,
    pub min_cluster_score:      f64,
    pub min_cluster_members:    usize,
    pub seed_default_rules:     bool,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            analysis_interval_secs: 300,
            fetch_limit:            1000,
            initial_lookback_secs:  3600,
            min_cluster_score:      crate::scoring::SIGNIFICANT_SCORE,
            min_cluster_members:    crate::scoring::SIGNIFICANT_MEMBERS,
            seed_default_rules:     true,
        }
    }
}

impl DefenseConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Cannot parse {}", path.display()))?;
        Ok(config)
    }

    pub fn analysis_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.analysis_interval_secs.max(1))
    }
}
