//! Shared observable counters and the null sentinels used across the crate.

use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Sentinel for an absent id or ordinal.
pub const NULL_VALUE: i64 = -1;

/// Sentinel for an absent recording or log position.
pub const NULL_POSITION: i64 = -1;

/// Sentinel for an absent timestamp.
pub const NULL_TIMESTAMP: i64 = -1;

/// Sentinel for an unbounded replay length.
pub const NULL_LENGTH: i64 = -1;

/// Sentinel for an absent counter id.
pub const NULL_COUNTER_ID: i32 = -1;

/// A cheaply cloneable handle to a shared 64-bit counter.
///
/// Writes use release ordering and reads use acquire ordering so an external
/// observer polling a clone of the handle sees values consistent with the
/// agent's transitions. The raw atomic is never exposed.
#[derive(Clone, Default)]
pub struct Counter {
    inner: Arc<AtomicI64>,
}

impl Counter {
    /// Create a counter holding `initial`.
    pub fn new(initial: i64) -> Self {
        Self {
            inner: Arc::new(AtomicI64::new(initial)),
        }
    }

    /// Read the current value.
    pub fn get(&self) -> i64 {
        self.inner.load(Ordering::Acquire)
    }

    /// Publish `value` with release semantics.
    pub fn set_release(&self, value: i64) {
        self.inner.store(value, Ordering::Release);
    }

    /// Advance the counter to `value` if it is greater than the stored value.
    ///
    /// Returns `true` if the stored value changed. The counter is therefore
    /// monotonic non-decreasing as long as it is only written through this
    /// method.
    pub fn propose_max_release(&self, value: i64) -> bool {
        let mut current = self.inner.load(Ordering::Acquire);
        while value > current {
            match self.inner.compare_exchange_weak(current, value, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}
