//! Sources that terminate immediately, or never.

use super::{EmptySubscription, Publisher, Subscriber, complete_subscriber, error_subscriber};
use crate::error::Error;
use std::marker::PhantomData;
use std::sync::Arc;

/// A publisher that completes without emitting.
///
/// Created by the [`empty`] function.
#[derive(Debug)]
#[must_use = "publishers do nothing unless subscribed"]
pub struct Empty<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Publisher<T> for Empty<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        complete_subscriber(subscriber.as_ref());
    }
}

/// Creates a publisher that completes immediately.
pub fn empty<T>() -> Empty<T> {
    Empty {
        _marker: PhantomData,
    }
}

/// A publisher that fails without emitting.
///
/// Created by the [`fail`] function.
#[derive(Debug)]
#[must_use = "publishers do nothing unless subscribed"]
pub struct Fail<T> {
    error: Error,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Publisher<T> for Fail<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        error_subscriber(subscriber.as_ref(), self.error.clone());
    }
}

/// Creates a publisher that fails immediately with `error`.
pub fn fail<T>(error: Error) -> Fail<T> {
    Fail {
        error,
        _marker: PhantomData,
    }
}

/// A publisher that subscribes and then stays silent.
///
/// Created by the [`never`] function.
#[derive(Debug)]
#[must_use = "publishers do nothing unless subscribed"]
pub struct Never<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Publisher<T> for Never<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Arc::new(EmptySubscription));
    }
}

/// Creates a publisher that never signals after `on_subscribe`.
pub fn never<T>() -> Never<T> {
    Never {
        _marker: PhantomData,
    }
}
