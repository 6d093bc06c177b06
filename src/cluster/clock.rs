use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// A source of wall-clock epoch time with millisecond resolution.
pub trait EpochClock {
    /// Milliseconds since the Unix epoch.
    fn time_ms(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl<C: EpochClock + ?Sized> EpochClock for &C {
    fn time_ms(&self) -> i64 {
        (**self).time_ms()
    }
}

impl<C: EpochClock + ?Sized> EpochClock for Rc<C> {
    fn time_ms(&self) -> i64 {
        (**self).time_ms()
    }
}

impl<C: EpochClock + ?Sized> EpochClock for Arc<C> {
    fn time_ms(&self) -> i64 {
        (**self).time_ms()
    }
}
