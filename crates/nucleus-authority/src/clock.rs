//! Time source injected into every component that reads "now".
//!
//! Production code uses [`SystemClock`]; tests drive rotation schedules and
//! certificate expiry deterministically with [`ManualClock`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same instant, so a test can hand one clone to the
/// service and keep another to advance time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Converts a std duration into a chrono duration, rejecting values chrono cannot represent.
pub(crate) fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|_| Error::BadParameter(format!("duration out of range: {d:?}")))
}

/// `at + d`, failing instead of overflowing.
pub(crate) fn add(at: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(to_chrono(d)?)
        .ok_or_else(|| Error::BadParameter(format!("timestamp out of range: {at} + {d:?}")))
}

/// Drops sub-second precision so timestamps round-trip through X.509 validity fields.
pub(crate) fn truncate_secs(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}
