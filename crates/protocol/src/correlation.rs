//! Correlation ids pairing a request envelope with its response.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound of the correlation counter, `2^53 - 1`.
///
/// This is the largest integer a JSON number carries exactly when the peer decodes
/// numbers as IEEE-754 doubles. The counter resets to zero before reaching it.
pub const MAX_CORRELATION_ID: u64 = (1 << 53) - 1;

/// Integer tag carried by a request and echoed back by its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Read an id from a raw JSON value.
    ///
    /// Only non-negative integers are ids. Anything else (negative numbers,
    /// fractions, strings, null) yields `None`, which matches no pending request.
    pub fn from_json(value: &Value) -> Option<Self> {
        if let Some(id) = value.as_u64() {
            return Some(Self(id));
        }
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= MAX_CORRELATION_ID as f64)
            .map(|f| Self(f as u64))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonic source of correlation ids for one messenger.
///
/// Uniqueness among pending requests is an accepted assumption rather than a
/// checked property: ids wrap to zero after `MAX_CORRELATION_ID - 1`, and no
/// request lives long enough for the counter to lap it.
#[derive(Debug, Default)]
pub struct CorrelationCounter {
    next: AtomicU64,
}

impl CorrelationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the counter at `value` (clamped into the valid range).
    pub fn starting_at(value: u64) -> Self {
        let value = if value >= MAX_CORRELATION_ID { 0 } else { value };
        Self {
            next: AtomicU64::new(value),
        }
    }

    /// Hand out the next id and advance the counter.
    pub fn next_id(&self) -> CorrelationId {
        let issued = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(advance(current))
            })
            // The closure never declines, so the Err arm is unreachable; it carries
            // the same previous value either way.
            .unwrap_or_else(|current| current);
        CorrelationId(issued)
    }
}

fn advance(current: u64) -> u64 {
    let following = current.saturating_add(1);
    if following >= MAX_CORRELATION_ID {
        0
    } else {
        following
    }
}
