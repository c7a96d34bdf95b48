//! Convert iterators into publishers.
//!
//! This module provides the [`iter`] function to turn any cloneable
//! `IntoIterator` into a cold [`Publisher`], plus [`just`] and [`range`]
//! built on it.

use super::{Publisher, Subscriber, Subscription};
use crate::error::Error;
use crate::types::{Demand, UNBOUNDED, validate_request};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A publisher that emits the items of an iterator under demand.
///
/// Created by the [`iter`] function. Each subscription iterates a fresh
/// clone of the source.
#[derive(Debug, Clone)]
#[must_use = "publishers do nothing unless subscribed"]
pub struct Iter<I> {
    items: I,
}

impl<I> Iter<I> {
    /// Creates a new `Iter` publisher.
    pub(crate) fn new(items: I) -> Self {
        Self { items }
    }
}

impl<I> Publisher<I::Item> for Iter<I>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<I::Item>>) {
        let subscription =
            IterSubscription::new(self.items.clone().into_iter(), Arc::clone(&subscriber));
        subscriber.on_subscribe(subscription.clone());
        // Completes empty sources even without demand.
        subscription.drain();
    }
}

struct IterSubscription<It: Iterator> {
    // Only the turn holding `wip` advances the iterator.
    iter: Mutex<Peekable<It>>,
    // Taken on termination or cancel.
    actual: Mutex<Option<Arc<dyn Subscriber<It::Item>>>>,
    requested: Demand,
    wip: AtomicUsize,
    cancelled: AtomicBool,
    bad_request: ArrayQueue<Error>,
    this: Weak<Self>,
}

impl<It> IterSubscription<It>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
{
    fn new(iter: It, actual: Arc<dyn Subscriber<It::Item>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            iter: Mutex::new(iter.peekable()),
            actual: Mutex::new(Some(actual)),
            requested: Demand::new(),
            wip: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            bad_request: ArrayQueue::new(1),
            this: this.clone(),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Marks the subscription finished and hands back the subscriber for
    /// its last signal.
    fn finish(&self) -> Option<Arc<dyn Subscriber<It::Item>>> {
        self.cancelled.store(true, Ordering::Release);
        self.actual.lock().take()
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if self.is_cancelled() {
                return;
            }
            let Some(actual) = self.actual.lock().clone() else {
                return;
            };
            if let Some(err) = self.bad_request.pop() {
                drop(self.finish());
                actual.on_error(err);
                return;
            }
            if self.iter.lock().peek().is_none() {
                drop(self.finish());
                actual.on_complete();
                return;
            }

            let requested = self.requested.get();
            let mut emitted = 0_u64;
            while emitted != requested {
                if self.is_cancelled() {
                    return;
                }
                let next = self.iter.lock().next();
                let Some(item) = next else { break };
                actual.on_next(item);
                emitted += 1;
                if self.is_cancelled() {
                    return;
                }
                if self.iter.lock().peek().is_none() {
                    drop(self.finish());
                    actual.on_complete();
                    return;
                }
            }
            if emitted != 0 && requested != UNBOUNDED {
                self.requested.produced(emitted);
            }

            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                return;
            }
            missed = remaining;
        }
    }
}

impl<It> Subscription for IterSubscription<It>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
{
    fn request(&self, n: u64) {
        match validate_request(n) {
            Ok(n) => {
                self.requested.add(n);
            }
            Err(err) => {
                let _ = self.bad_request.force_push(err);
            }
        }
        if let Some(this) = self.this.upgrade() {
            this.drain();
        }
    }

    fn cancel(&self) {
        drop(self.finish());
    }
}

/// Convert an iterable into a publisher.
///
/// Items are emitted synchronously on the thread that grants demand, which
/// makes this the workhorse for tests and for wrapping in-memory data.
///
/// # Examples
///
/// ```ignore
/// use rivulet::stream::iter;
/// use rivulet::test_utils::TestSubscriber;
///
/// let ts = TestSubscriber::unbounded();
/// ts.subscribe_to(&iter(vec![1, 2, 3]));
/// assert_eq!(ts.values(), vec![1, 2, 3]);
/// ```
pub fn iter<I>(items: I) -> Iter<I>
where
    I: IntoIterator + Clone,
{
    Iter::new(items)
}

/// A publisher of exactly one value.
pub fn just<T: Clone>(value: T) -> Iter<Option<T>> {
    Iter::new(Some(value))
}

/// A publisher of `count` consecutive integers starting at `start`.
pub fn range(start: i64, count: usize) -> Iter<std::ops::Range<i64>> {
    let count = i64::try_from(count).unwrap_or(i64::MAX);
    Iter::new(start..start.saturating_add(count))
}
