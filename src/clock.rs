//! Injectable time source.
//!
//! Receipt dates default to "now". Hard-wiring the system clock makes the
//! date rules untestable, so constructors take a [`Clock`] and tests pass a
//! [`FixedClock`].

use chrono::{DateTime, Timelike, Utc};

/// Source of the current UTC time.
pub trait Clock {
    /// Return the current time, truncated to whole seconds.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        now.with_nanosecond(0).unwrap_or(now)
    }
}

/// Clock that always reports the same instant.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use seampack::clock::{Clock, FixedClock};
///
/// let instant = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
/// let clock = FixedClock(instant);
/// assert_eq!(clock.now(), instant);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
