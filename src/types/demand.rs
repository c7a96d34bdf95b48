//! Demand accounting.
//!
//! Demand is an unsigned count of values a consumer has authorized.
//! `u64::MAX` means unbounded; once reached it stays there, so every
//! addition saturates and subtraction leaves it alone.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unbounded demand.
pub const UNBOUNDED: u64 = u64::MAX;

/// Adds two demand amounts, saturating at [`UNBOUNDED`].
#[must_use]
pub const fn add_cap(a: u64, b: u64) -> u64 {
    a.saturating_add(b)
}

/// Subtracts produced units from outstanding demand.
///
/// Unbounded demand is never reduced. Producing more than was requested
/// floors at zero; the second element reports whether that happened.
#[must_use]
pub const fn sub_floor(requested: u64, produced: u64) -> (u64, bool) {
    if requested == UNBOUNDED {
        return (UNBOUNDED, false);
    }
    match requested.checked_sub(produced) {
        Some(left) => (left, false),
        None => (0, true),
    }
}

/// Validates a `request(n)` argument.
pub fn validate_request(n: u64) -> Result<u64> {
    if n == 0 {
        Err(Error::invalid_demand(n))
    } else {
        Ok(n)
    }
}

/// An atomic demand counter with saturating accumulation.
#[derive(Debug, Default)]
pub struct Demand {
    value: AtomicU64,
}

impl Demand {
    /// Creates a counter with no outstanding demand.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Adds `n`, saturating at [`UNBOUNDED`]. Returns the previous value.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = add_cap(current, n);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return prev,
                Err(actual) => current = actual,
            }
        }
    }

    /// Subtracts `n` unless unbounded. Returns the new value.
    pub fn produced(&self, n: u64) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let (next, _) = sub_floor(current, n);
            if next == current {
                return current;
            }
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Takes the whole amount, leaving zero.
    pub fn take(&self) -> u64 {
        self.value.swap(0, Ordering::AcqRel)
    }

    /// Returns the current amount.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
