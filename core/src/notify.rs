//! Notification sinks.
//!
//! The engines receive a sink at construction and call `emit` for every
//! notification. `deliver` wraps that call so a failing transport is logged
//! and otherwise ignored.

use crate::event::DefenseEvent;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: &DefenseEvent) -> Result<()>;
}

/// Best-effort delivery. Never propagates.
pub fn deliver(sink: &dyn NotificationSink, event: &DefenseEvent) {
    if let Err(e) = sink.emit(event) {
        log::warn!("Notification '{}' not delivered: {e:#}", event.name());
    }
}

/// Writes each notification as a log line.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn emit(&self, event: &DefenseEvent) -> Result<()> {
        log::info!("[{}] {}", event.name(), serde_json::to_string(event)?);
        Ok(())
    }
}

/// Keeps every notification in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DefenseEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DefenseEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl NotificationSink for MemorySink {
    fn emit(&self, event: &DefenseEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Appends one JSON object per line for a downstream push relay.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }
}

impl NotificationSink for JsonlSink {
    fn emit(&self, event: &DefenseEvent) -> Result<()> {
        let line = serde_json::to_string(event)? + "\n";
        let _guard = self.lock.lock();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }
}
