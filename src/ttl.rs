use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// Upper bound of an advertised TTL, in seconds.
pub const MAX_TTL_SECS: i64 = 3600;

/// Jitter is drawn from `0..JITTER_SPAN_SECS`.
pub const JITTER_SPAN_SECS: i64 = 100;

/// Computes the TTL advertised for a resource with `remaining` lifetime.
///
/// Returns `None` once the resource has expired; callers must report it as
/// unavailable rather than hand out stale material. Otherwise the TTL is
/// `min(3600, remaining * 0.8)` shortened by a random amount below 100
/// seconds, so that many pollers of one domain drift apart instead of
/// refreshing in lock step. The jitter is only applied when it keeps the
/// TTL positive.
pub fn compute_ttl<R: Rng + ?Sized>(remaining: TimeDelta, rng: &mut R) -> Option<i64> {
    if remaining <= TimeDelta::zero() {
        return None;
    }
    let mut ttl = if remaining > TimeDelta::seconds(MAX_TTL_SECS) {
        MAX_TTL_SECS
    } else {
        (remaining.num_milliseconds() as f64 / 1000.0 * 0.8) as i64
    };
    let n = rng.gen_range(0..JITTER_SPAN_SECS);
    if n < ttl {
        ttl -= n;
    }
    Some(ttl)
}

/// Source of the current time.
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to, for tests.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, delta: TimeDelta) {
        self.millis
            .fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}
