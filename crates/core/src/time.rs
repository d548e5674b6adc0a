//! Local time and the clock abstraction.
//!
//! Every time-dependent decision in the reflector reads an injected
//! [`Clock`], so tests drive the whole system off a [`ManualClock`]
//! without waiting on real time.

use std::sync::{atomic, Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time, in milliseconds since Epoch.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    millis: u64,
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).millis;
        let last = LAST.load(atomic::Ordering::SeqCst);

        // If the system clock stepped backwards, hold the last reading.
        if now < last {
            Self { millis: last }
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            Self { millis: now }
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs * 1000,
        }
    }

    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    pub const fn as_secs(&self) -> u64 {
        self.millis / 1000
    }

    /// Whether this is the zero sentinel (the Epoch itself).
    pub const fn is_zero(&self) -> bool {
        self.millis == 0
    }
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self { millis }
    }
}

/// Subtract two local times. Saturates at zero.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis.saturating_add(other.0),
        }
    }
}

impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis.saturating_sub(other.0),
        }
    }
}

/// Time duration as measured locally, in milliseconds.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    pub const ZERO: LocalDuration = LocalDuration(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0.saturating_add(other.0))
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0.saturating_mul(other))
    }
}

impl From<std::time::Duration> for LocalDuration {
    fn from(d: std::time::Duration) -> Self {
        Self(d.as_millis() as u64)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(d: LocalDuration) -> Self {
        std::time::Duration::from_millis(d.0)
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 1000 {
            write!(f, "{}ms", self.0)
        } else if self.as_secs() < 60 {
            write!(f, "{}s", self.as_secs())
        } else {
            write!(f, "{}m{}s", self.as_secs() / 60, self.as_secs() % 60)
        }
    }
}

/// Clock that tells the time.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> LocalTime {
        LocalTime::now()
    }
}

/// A clock that only moves when told to. Shared between the test and the
/// services under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<LocalTime>>,
}

impl ManualClock {
    pub fn new(start: LocalTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, time: LocalTime) {
        *self.inner.lock().unwrap() = time;
    }

    pub fn advance(&self, by: LocalDuration) {
        let mut time = self.inner.lock().unwrap();
        *time = *time + by;
    }
}

impl Clock for ManualClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.lock().unwrap()
    }
}
