//! Periodic driver for the cluster engine.
//!
//! The first tick fires immediately. Each tick hands a pass to the blocking
//! pool and goes straight back to waiting, so a tick that lands while a pass
//! is still running meets the engine's guard and is dropped.
//!
//! Shutdown stops new passes; a pass already in flight runs to completion.

use crate::cluster_engine::{PassOutcome, ThreatClusterEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

pub async fn run_periodic(
    engine: Arc<ThreatClusterEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("threat analysis scheduled every {}s", period.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let engine = engine.clone();
                tokio::task::spawn_blocking(move || {
                    if let PassOutcome::Skipped = engine.analyze_threats() {
                        log::debug!("scheduled tick dropped: previous pass still running");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::info!("threat analysis scheduler stopped");
}
