//! Injectable sources of the current time.
//!
//! The manager never asks the system for the time directly. Production code
//! uses [`SystemClock`], tests use a [`FixedClock`].

use std::sync::RwLock;
use chrono::{DateTime, Duration, Utc};


//------------ Clock ---------------------------------------------------------

pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}


//------------ SystemClock ---------------------------------------------------

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}


//------------ FixedClock ----------------------------------------------------

/// A clock that stands still until it is moved explicitly.
#[derive(Debug)]
pub struct FixedClock(RwLock<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        FixedClock(RwLock::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.write().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.write().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.read().unwrap()
    }
}


//------------ to_chrono -----------------------------------------------------

/// Converts a standard duration, saturating at the largest chrono duration.
pub fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}


//============ Tests =========================================================
