//! Optional tracing integration.
//!
//! With the `tracing-integration` feature the logging macros below are the
//! real `tracing` macros. Without it they expand to `()`, so call sites on
//! the push path cost nothing when logging is off and still work in
//! expression position.
//!
//! ```ignore
//! use crate::tracing_compat::{debug, trace};
//!
//! trace!(produced, "conserving demand before swap");
//! debug!("sequence exhausted; completing");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

// A single uniquely named macro, re-exported under each level's name. A
// local `macro_rules! warn` would clash with the built-in `#[warn]`
// attribute at the re-export.
#[cfg(not(feature = "tracing-integration"))]
macro_rules! noop_log {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing-integration"))]
#[allow(unused_imports)]
pub(crate) use {
    noop_log as debug, noop_log as error, noop_log as info, noop_log as trace, noop_log as warn,
};

#[cfg(test)]
mod tests {
    use super::{debug, trace, warn};

    #[test]
    fn macros_work_in_statement_and_expression_position() {
        let value = 3_u64;
        trace!(value, "statement position");
        match Some(value) {
            Some(v) => debug!(v, "expression position"),
            None => warn!("unreachable"),
        }
    }
}
