//! Side-effecting defense operations.
//!
//! RULE: The rule engine never writes enforcement state itself. It calls an
//! Enforcer, and whatever the Enforcer returns decides the history result.
//!
//! Alerts are not here: an alert is a notification, not an enforcement.

use crate::{
    clock::Clock,
    error::EngineResult,
    store::{EnforcementEntry, EnforcementKind, ThreatStore},
    types::Timestamp,
};
use std::sync::Arc;

pub trait Enforcer: Send + Sync {
    fn block_ip(&self, ip: &str, until: Option<Timestamp>) -> EngineResult<()>;
    fn block_device(&self, fingerprint: &str, until: Option<Timestamp>) -> EngineResult<()>;
    fn rate_limit(&self, ip: &str, requests_per_minute: u32, until: Option<Timestamp>) -> EngineResult<()>;
    fn quarantine(&self, merchant_id: &str, until: Option<Timestamp>) -> EngineResult<()>;
}

/// Records every enforcement in the `enforcement_entry` table, where a
/// request-time consumer looks it up.
pub struct LedgerEnforcer {
    store: Arc<ThreatStore>,
    clock: Arc<dyn Clock>,
}

impl LedgerEnforcer {
    pub fn new(store: Arc<ThreatStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn record(
        &self,
        kind: EnforcementKind,
        target: &str,
        until: Option<Timestamp>,
        requests_per_minute: Option<u32>,
    ) -> EngineResult<()> {
        self.store.insert_enforcement(&EnforcementEntry {
            kind,
            target: target.to_string(),
            until,
            requests_per_minute,
            created_at: self.clock.now(),
        })?;
        log::info!(
            "enforced {} on {target} until {}",
            kind.as_str(),
            until.map(|t| t.to_rfc3339()).unwrap_or_else(|| "lifted".to_string())
        );
        Ok(())
    }
}

impl Enforcer for LedgerEnforcer {
    fn block_ip(&self, ip: &str, until: Option<Timestamp>) -> EngineResult<()> {
        self.record(EnforcementKind::Ip, ip, until, None)
    }

    fn block_device(&self, fingerprint: &str, until: Option<Timestamp>) -> EngineResult<()> {
        self.record(EnforcementKind::Device, fingerprint, until, None)
    }

    fn rate_limit(&self, ip: &str, requests_per_minute: u32, until: Option<Timestamp>) -> EngineResult<()> {
        self.record(EnforcementKind::RateLimit, ip, until, Some(requests_per_minute))
    }

    fn quarantine(&self, merchant_id: &str, until: Option<Timestamp>) -> EngineResult<()> {
        self.record(EnforcementKind::Merchant, merchant_id, until, None)
    }
}
