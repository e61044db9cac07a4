//! Time source for deployment records
//!
//! `created` and `last_modified` stamps come from a `Clock`, so tests can
//! order records without sleeping between deployments.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that moves forward by a fixed step on every read
#[cfg(test)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    step: chrono::Duration,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    /// A clock that ticks one second per read, so successive records sort by creation
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::ticking(start, chrono::Duration::seconds(1))
    }

    pub fn ticking(start: DateTime<Utc>, step: chrono::Duration) -> Self {
        MockClock {
            now: std::sync::Mutex::new(start),
            step,
        }
    }

    pub fn peek(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        let current = *now;
        *now = current + self.step;
        current
    }
}
