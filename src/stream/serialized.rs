//! Serialized delivery to a downstream subscriber.
//!
//! A driver may receive signals for the same downstream from more than one
//! thread: values from the producer, a protocol error from the consumer's
//! `request`, a companion verdict from a third stream. [`Serialized`]
//! funnels them through a lock-free queue; whichever caller moves `wip`
//! from zero drains the queue, the rest enqueue and return. Reentrant calls
//! (a downstream `on_next` that synchronously causes another signal) are
//! queued the same way, which keeps the stack flat.
//!
//! The first terminal signal wins. Anything after it is dropped and
//! reported through [`StreamConfig`]'s hooks. The downstream handle is let
//! go once the terminal signal is delivered, or on [`Serialized::release`]
//! after a cancel, so a subscriber holding its own subscription does not
//! keep the driver alive.

use crate::config::StreamConfig;
use crate::error::Error;
use crate::stream::{BoxSubscriber, BoxSubscription};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

enum Event<T> {
    Next(T),
    Error(Error),
    Complete,
}

/// Serializing wrapper around a downstream subscriber.
pub(crate) struct Serialized<T> {
    // Locked only to clone or take the handle.
    actual: Mutex<Option<BoxSubscriber<T>>>,
    queue: SegQueue<Event<T>>,
    wip: AtomicUsize,
    // Only touched while draining.
    done: AtomicBool,
    config: StreamConfig,
}

impl<T> Serialized<T> {
    pub(crate) fn new(actual: BoxSubscriber<T>, config: StreamConfig) -> Self {
        Self {
            actual: Mutex::new(Some(actual)),
            queue: SegQueue::new(),
            wip: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            config,
        }
    }

    /// Passes the subscription straight through; it precedes every other
    /// signal by construction.
    pub(crate) fn on_subscribe(&self, subscription: BoxSubscription) {
        let actual = self.actual.lock().clone();
        if let Some(actual) = actual {
            actual.on_subscribe(subscription);
        }
    }

    pub(crate) fn on_next(&self, item: T) {
        self.emit(Event::Next(item));
    }

    pub(crate) fn on_error(&self, error: Error) {
        self.emit(Event::Error(error));
    }

    pub(crate) fn on_complete(&self) {
        self.emit(Event::Complete);
    }

    /// Lets go of the downstream after it cancelled. Signals still in
    /// flight are discarded silently.
    pub(crate) fn release(&self) {
        let released = self.actual.lock().take();
        drop(released);
    }

    /// Returns `true` once a terminal signal has been delivered.
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn emit(&self, event: Event<T>) {
        self.queue.push(event);
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            while let Some(event) = self.queue.pop() {
                self.deliver(event);
            }
            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                return;
            }
            missed = remaining;
        }
    }

    fn deliver(&self, event: Event<T>) {
        if self.done.load(Ordering::Relaxed) {
            match event {
                Event::Next(_) => self.config.report_next_dropped(),
                Event::Error(err) => self.config.report_error_dropped(&err),
                Event::Complete => {}
            }
            return;
        }
        match event {
            Event::Next(item) => {
                let actual = self.actual.lock().clone();
                if let Some(actual) = actual {
                    actual.on_next(item);
                }
            }
            Event::Error(err) => {
                self.done.store(true, Ordering::Release);
                let actual = self.actual.lock().take();
                if let Some(actual) = actual {
                    actual.on_error(err);
                }
            }
            Event::Complete => {
                self.done.store(true, Ordering::Release);
                let actual = self.actual.lock().take();
                if let Some(actual) = actual {
                    actual.on_complete();
                }
            }
        }
    }
}
