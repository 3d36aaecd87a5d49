//! defense-core: fraud threat clustering and automated defense.
//!
//! A periodic pass pulls recent fraud signals from the store, groups them
//! with four independent detectors, persists the significant clusters and
//! runs every active action rule against each new cluster.

pub mod clock;
pub mod cluster_engine;
pub mod config;
pub mod defense;
pub mod detectors;
pub mod enforcement;
pub mod error;
pub mod event;
pub mod notify;
pub mod report;
pub mod rule;
pub mod rule_engine;
pub mod scheduler;
pub mod scoring;
pub mod service;
pub mod store;
pub mod threat;
pub mod types;
