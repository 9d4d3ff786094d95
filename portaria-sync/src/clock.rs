//! Time sources and server clock correction.
//!
//! Terminals at the school gate often have drifting clocks. `ClockService`
//! keeps an offset estimated from server `Date` headers and applies it to
//! every timestamp the engine produces.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock of this machine
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Minimum change in the estimate before the offset is replaced. Server
/// `Date` headers have one-second resolution.
const MIN_CORRECTION_MS: i64 = 1_000;

/// Corrected clock: local source plus the estimated server offset
pub struct ClockService {
    source: Arc<dyn Clock>,
    offset_ms: AtomicI64,
    observed: AtomicBool,
}

impl ClockService {
    pub fn new(source: Arc<dyn Clock>) -> Self {
        Self {
            source,
            offset_ms: AtomicI64::new(0),
            observed: AtomicBool::new(false),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Uncorrected local time, used to time requests
    pub fn local_now(&self) -> DateTime<Utc> {
        self.source.now()
    }

    pub fn offset(&self) -> Duration {
        Duration::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }

    /// Whether any server time has been observed yet
    pub fn is_synchronized(&self) -> bool {
        self.observed.load(Ordering::Relaxed)
    }

    /// Update the offset from a server timestamp taken somewhere between
    /// `sent_at` and `received_at` (both local, uncorrected).
    pub fn observe(
        &self,
        server_time: DateTime<Utc>,
        sent_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Duration {
        let round_trip = received_at - sent_at;
        let midpoint = sent_at + round_trip / 2;
        let estimate = (server_time - midpoint).num_milliseconds();

        let current = self.offset_ms.load(Ordering::Relaxed);
        if !self.observed.swap(true, Ordering::Relaxed)
            || (estimate - current).abs() >= MIN_CORRECTION_MS
        {
            self.offset_ms.store(estimate, Ordering::Relaxed);
            if estimate.abs() >= MIN_CORRECTION_MS {
                tracing::debug!(
                    offset_ms = estimate,
                    round_trip_ms = round_trip.num_milliseconds(),
                    "Adjusted clock offset from server time"
                );
            }
        }
        self.offset()
    }

    /// Parse an RFC 2822 `Date` header and feed it to `observe`
    pub fn observe_http_date(
        &self,
        header: &str,
        sent_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Option<Duration> {
        match DateTime::parse_from_rfc2822(header) {
            Ok(server_time) => {
                Some(self.observe(server_time.with_timezone(&Utc), sent_at, received_at))
            }
            Err(e) => {
                tracing::debug!(header, error = %e, "Ignoring unparsable Date header");
                None
            }
        }
    }

    pub fn reset(&self) {
        self.offset_ms.store(0, Ordering::Relaxed);
        self.observed.store(false, Ordering::Relaxed);
    }
}

impl Clock for ClockService {
    fn now(&self) -> DateTime<Utc> {
        self.source.now() + self.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(at(10, 0, 0));
        assert_eq!(clock.now(), at(10, 0, 0));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), at(10, 5, 0));
    }

    #[test]
    fn test_offset_uses_round_trip_midpoint() {
        let local = Arc::new(ManualClock::new(at(10, 0, 4)));
        let clock = ClockService::new(local.clone());

        // request sent at 10:00:00, answered at 10:00:04 local; server said 10:02:02
        let offset = clock.observe(at(10, 2, 2), at(10, 0, 0), at(10, 0, 4));
        assert_eq!(offset, Duration::seconds(120));
        assert_eq!(clock.now(), at(10, 2, 4));
    }

    #[test]
    fn test_sub_second_jitter_is_ignored() {
        let clock = ClockService::new(Arc::new(ManualClock::new(at(10, 0, 0))));
        clock.observe(at(10, 0, 30), at(10, 0, 0), at(10, 0, 0));
        let before = clock.offset();

        let jittered = at(10, 0, 30) + Duration::milliseconds(400);
        clock.observe(jittered, at(10, 0, 0), at(10, 0, 0));
        assert_eq!(clock.offset(), before);
    }

    #[test]
    fn test_http_date_header() {
        let clock = ClockService::new(Arc::new(ManualClock::new(at(10, 0, 0))));
        let offset = clock
            .observe_http_date("Mon, 10 Mar 2025 09:59:00 GMT", at(10, 0, 0), at(10, 0, 0))
            .unwrap();
        assert_eq!(offset, Duration::seconds(-60));
        assert!(clock.is_synchronized());

        assert!(clock
            .observe_http_date("not a date", at(10, 0, 0), at(10, 0, 0))
            .is_none());
    }
}
