//! Composition root: wires one store, clock and sink into both engines.
//!
//! RULE: Build exactly one DefenseService per process and hand out clones of
//! its Arcs. Two cluster engines over one database would double-analyse.

use crate::{
    clock::{Clock, ManualClock},
    cluster_engine::ThreatClusterEngine,
    config::DefenseConfig,
    enforcement::{Enforcer, LedgerEnforcer},
    error::EngineResult,
    notify::{MemorySink, NotificationSink},
    rule_engine::ActionRuleEngine,
    store::ThreatStore,
    types::Timestamp,
};
use std::sync::Arc;

pub struct DefenseService {
    pub store:  Arc<ThreatStore>,
    pub rules:  Arc<ActionRuleEngine>,
    pub engine: Arc<ThreatClusterEngine>,
}

impl DefenseService {
    /// Production wiring: enforcement goes to the store's ledger.
    pub fn build(
        store: Arc<ThreatStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: DefenseConfig,
    ) -> Self {
        let enforcer = Arc::new(LedgerEnforcer::new(store.clone(), clock.clone()));
        Self::with_enforcer(store, enforcer, sink, clock, config)
    }

    pub fn with_enforcer(
        store: Arc<ThreatStore>,
        enforcer: Arc<dyn Enforcer>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: DefenseConfig,
    ) -> Self {
        let rules = Arc::new(ActionRuleEngine::new(store.clone(), enforcer, sink.clone(), clock.clone()));
        let engine = Arc::new(ThreatClusterEngine::new(store.clone(), rules.clone(), sink, clock, config));
        Self { store, rules, engine }
    }
}

/// In-memory service with a manual clock and a recording sink.
pub struct TestRig {
    pub service: DefenseService,
    pub clock:   Arc<ManualClock>,
    pub sink:    Arc<MemorySink>,
}

impl TestRig {
    pub fn build(start: Timestamp) -> EngineResult<Self> {
        Self::build_with(start, None, DefenseConfig::default())
    }

    /// `enforcer` None means the ledger enforcer.
    pub fn build_with(
        start: Timestamp,
        enforcer: Option<Arc<dyn Enforcer>>,
        config: DefenseConfig,
    ) -> EngineResult<Self> {
        let store = Arc::new(ThreatStore::in_memory()?);
        store.migrate()?;
        Ok(Self::over_store(store, start, enforcer, config))
    }

    /// Same wiring over a store the caller prepared.
    pub fn over_store(
        store: Arc<ThreatStore>,
        start: Timestamp,
        enforcer: Option<Arc<dyn Enforcer>>,
        config: DefenseConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let sink = Arc::new(MemorySink::new());
        let service = match enforcer {
            Some(enforcer) => {
                DefenseService::with_enforcer(store, enforcer, sink.clone(), clock.clone(), config)
            }
            None => DefenseService::build(store, sink.clone(), clock.clone(), config),
        };
        Self { service, clock, sink }
    }

    pub fn store(&self) -> &ThreatStore {
        &self.service.store
    }
}
