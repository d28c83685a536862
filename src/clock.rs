use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

/// Wall-clock source used by every time-dependent component.
///
/// The sampler, aggregator, retention scheduler and query engine all take
/// their notion of "now" from here so tests can drive time explicitly.
pub trait Clock: Send + Sync {
    /// Current instant, truncated to second resolution.
    fn now(&self) -> DateTime<Utc>;

    /// Current instant as Unix epoch seconds.
    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        Utc.timestamp_opt(now.timestamp(), 0)
            .single()
            .unwrap_or(now)
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    epoch_secs: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            epoch_secs: AtomicI64::new(epoch_secs),
        })
    }

    /// Moves the clock forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.epoch_secs.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jumps the clock to an absolute instant.
    pub fn set(&self, epoch_secs: i64) {
        self.epoch_secs.store(epoch_secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.epoch_secs.load(Ordering::SeqCst), 0)
            .single()
            .expect("manual clock instant in range")
    }
}

/// Rounds an epoch-seconds instant down to the start of its UTC hour.
pub fn hour_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(3600)
}

/// Rounds an epoch-seconds instant down to the start of its UTC day.
pub fn day_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(86_400)
}
