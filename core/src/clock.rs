//! Time source for the engines.
//!
//! Expiry, watermark and creation timestamps all read from an injected
//! Clock so a pass can be replayed deterministically in tests.

use crate::types::Timestamp;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The process wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { current: Mutex::new(start) }
    }

    /// Advance by `by`. Returns the new instant.
    pub fn advance(&self, by: Duration) -> Timestamp {
        let mut current = self.current.lock();
        *current += by;
        *current
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock()
    }
}
