//! Per-subscription publisher construction.

use super::{BoxPublisher, Publisher, Subscriber, error_subscriber};
use crate::error::Result;
use crate::util::call_guarded;
use std::sync::Arc;

/// A publisher that builds a fresh inner publisher for every subscriber.
///
/// Created by the [`defer`] function. A factory error (or panic) is
/// delivered to the subscriber as `on_error`.
#[must_use = "publishers do nothing unless subscribed"]
pub struct Defer<F> {
    factory: F,
}

impl<T, F> Publisher<T> for Defer<F>
where
    F: Fn() -> Result<BoxPublisher<T>> + Send + Sync,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        match call_guarded(true, || (self.factory)()) {
            Ok(inner) => inner.subscribe(subscriber),
            Err(err) => error_subscriber(subscriber.as_ref(), err),
        }
    }
}

/// Defers publisher construction until subscription.
///
/// Useful when each subscription (for example each retry attempt) should
/// observe fresh state.
pub fn defer<T, F>(factory: F) -> Defer<F>
where
    F: Fn() -> Result<BoxPublisher<T>> + Send + Sync,
{
    Defer { factory }
}
