//! Fault containment for collaborator calls.
//!
//! Cursors and factories are user code running on the driver's stack. A
//! failure there must come back as an ordinary `Err` so the driver can
//! deliver it downstream, never unwind through the driver's turn.

use crate::error::{Error, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Runs `f`, converting a panic into [`ErrorKind::Panicked`](crate::error::ErrorKind::Panicked)
/// when `capture_panics` is set.
pub(crate) fn call_guarded<R>(capture_panics: bool, f: impl FnOnce() -> Result<R>) -> Result<R> {
    if !capture_panics {
        return f();
    }
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Error::from_panic(payload.as_ref())),
    }
}
