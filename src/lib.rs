//! Rivulet: demand-driven sequencing and retry for push streams.
//!
//! # Overview
//!
//! Rivulet is the small concurrency core underneath stream composition:
//! publishers push values to subscribers, subscribers grant demand, and
//! nothing is ever emitted that was not asked for. On top of that protocol
//! it provides the two drivers that need careful state handling:
//!
//! - [`Concat`](stream::Concat) subscribes to a sequence of publishers one
//!   after another, in constant stack even when every publisher completes
//!   synchronously.
//! - [`RetryWhen`](stream::RetryWhen) hides a source's failures behind a
//!   companion stream that decides whether to retry, finish, or fail.
//!
//! Both share a [`SubscriptionArbiter`](stream::SubscriptionArbiter), which
//! carries unconsumed demand from one upstream to the next.
//!
//! # Core Guarantees
//!
//! - **Bounded stack**: synchronous completion is trampolined, never recursed
//! - **Demand conservation**: switching upstreams never loses or duplicates demand
//! - **Exactly-once cancel**: every upstream sees at most one `cancel`
//! - **No escaping faults**: cursor and factory failures, panics included, arrive as `on_error`
//!
//! # Module Structure
//!
//! - [`stream`]: Protocol traits, sources, the arbiter, and the drivers
//! - [`types`]: Demand arithmetic
//! - [`error`](mod@error): Error types
//! - [`config`]: Driver configuration and dropped-signal hooks
//! - [`tracing_compat`]: Optional tracing integration (requires `tracing-integration` feature)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod error;
pub mod stream;
pub mod tracing_compat;
pub mod types;
pub(crate) mod util;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use config::{ConfigError, Hooks, StreamConfig};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use stream::{
    BoxPublisher, Concat, Publisher, RetryWhen, Subscriber, Subscription, SubscriptionArbiter,
    concat, retry_when,
};
pub use types::{Demand, UNBOUNDED};
