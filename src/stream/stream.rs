//! The Reactive-Streams protocol traits.
//!
//! A [`Publisher`] produces values for a [`Subscriber`]. The subscriber
//! receives exactly one [`Subscription`] through `on_subscribe`, uses it to
//! grant demand, and then receives at most that many `on_next` calls
//! followed by at most one terminal signal.
//!
//! # Rules
//!
//! - `on_subscribe` precedes every other call, exactly once.
//! - No call follows `on_error` or `on_complete`.
//! - The number of `on_next` calls never exceeds the cumulative demand.
//! - `request(0)` is a protocol violation; `u64::MAX` means unbounded.
//! - `cancel` is idempotent.
//!
//! All methods take `&self`: signals may arrive from whichever thread the
//! producer runs on, while `request`/`cancel` arrive from the consumer's.

use crate::error::Error;
use std::sync::Arc;

/// Handle used by a subscriber to request values from, or cancel, a producer.
pub trait Subscription: Send + Sync {
    /// Grants `n` more units of demand. `n` must be positive.
    fn request(&self, n: u64);

    /// Stops the producer. Idempotent.
    fn cancel(&self);
}

/// Receiver of a producer's signals.
pub trait Subscriber<T>: Send + Sync {
    /// Receives the subscription. Called exactly once, before anything else.
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    /// Receives a value. Bounded by granted demand.
    fn on_next(&self, item: T);

    /// Receives a terminal failure.
    fn on_error(&self, error: Error);

    /// Receives successful termination.
    fn on_complete(&self);
}

/// A cold producer of values.
///
/// Every call to `subscribe` starts an independent run.
pub trait Publisher<T>: Send + Sync {
    /// Subscribes `subscriber` to a new run of this producer.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// A shared, type-erased publisher.
pub type BoxPublisher<T> = Arc<dyn Publisher<T>>;

/// A shared, type-erased subscriber.
pub type BoxSubscriber<T> = Arc<dyn Subscriber<T>>;

/// A shared, type-erased subscription.
pub type BoxSubscription = Arc<dyn Subscription>;

// Implement Publisher for Arc<P> where P is a Publisher
impl<T, P: Publisher<T> + ?Sized> Publisher<T> for Arc<P> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (**self).subscribe(subscriber);
    }
}

// Implement Publisher for Box<P> where P is a Publisher
impl<T, P: Publisher<T> + ?Sized> Publisher<T> for Box<P> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (**self).subscribe(subscriber);
    }
}

/// A subscription that ignores every call.
///
/// Handed to subscribers of sources that terminate immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySubscription;

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Signals `on_subscribe` with an [`EmptySubscription`] followed by `on_error`.
pub fn error_subscriber<T>(subscriber: &dyn Subscriber<T>, error: Error) {
    subscriber.on_subscribe(Arc::new(EmptySubscription));
    subscriber.on_error(error);
}

/// Signals `on_subscribe` with an [`EmptySubscription`] followed by `on_complete`.
pub fn complete_subscriber<T>(subscriber: &dyn Subscriber<T>) {
    subscriber.on_subscribe(Arc::new(EmptySubscription));
    subscriber.on_complete();
}
