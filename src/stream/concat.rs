//! Sequential concatenation of a lazy sequence of publishers.
//!
//! [`Concat`] subscribes to each publisher of a sequence in turn and relays
//! its values downstream. The next publisher is subscribed only after the
//! previous one completed; the first failure ends the whole stream and the
//! rest of the sequence is never consulted.
//!
//! # Stack depth
//!
//! A publisher that completes synchronously inside `subscribe` re-enters
//! the driver before the call that subscribed it has returned. The driver
//! turns that recursion into iteration: re-entry only bumps a `wip` counter
//! and the active loop picks the completion up on its next pass, so
//! concatenating any number of instantly-completing publishers runs in
//! constant stack.
//!
//! # Demand
//!
//! All publishers share one [`SubscriptionArbiter`]. Before each switch the
//! number of values the finished publisher delivered is folded into the
//! arbiter, so the next publisher is asked only for what is still owed.

use super::arbiter::SubscriptionArbiter;
use super::serialized::Serialized;
use super::{BoxPublisher, Publisher, Subscriber, Subscription, error_subscriber};
use crate::config::StreamConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, trace};
use crate::util::call_guarded;
use parking_lot::Mutex;
use std::fmt;
use std::iter::Peekable;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A cursor over the publishers to concatenate.
///
/// The driver only calls a cursor from inside its own single-owner turn,
/// never concurrently, so implementations need no internal
/// synchronization. Both operations may fail; `Ok(None)` from
/// [`next_source`](Self::next_source) after `has_more` returned `true` is
/// itself a fault.
pub trait SourceCursor<T>: Send {
    /// Returns `true` if another publisher is available.
    fn has_more(&mut self) -> Result<bool>;

    /// Returns the next publisher.
    fn next_source(&mut self) -> Result<Option<BoxPublisher<T>>>;
}

/// Adapts an [`Iterator`] of publishers into a [`SourceCursor`].
pub struct IterCursor<I: Iterator> {
    iter: Peekable<I>,
}

impl<I: Iterator> fmt::Debug for IterCursor<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterCursor").finish_non_exhaustive()
    }
}

impl<I: Iterator> IterCursor<I> {
    /// Wraps `iter`.
    pub fn new(iter: I) -> Self {
        Self {
            iter: iter.peekable(),
        }
    }
}

impl<T, I> SourceCursor<T> for IterCursor<I>
where
    I: Iterator<Item = BoxPublisher<T>> + Send,
{
    fn has_more(&mut self) -> Result<bool> {
        Ok(self.iter.peek().is_some())
    }

    fn next_source(&mut self) -> Result<Option<BoxPublisher<T>>> {
        Ok(self.iter.next())
    }
}

type CursorFactory<T> = Arc<dyn Fn() -> Result<Box<dyn SourceCursor<T>>> + Send + Sync>;

/// A publisher concatenating a sequence of publishers.
///
/// Created by [`concat`], [`Concat::new`], or [`Concat::from_cursor_fn`].
/// Every subscription opens a fresh cursor.
#[must_use = "publishers do nothing unless subscribed"]
pub struct Concat<T> {
    cursors: CursorFactory<T>,
    config: StreamConfig,
}

impl<T: Send + 'static> Concat<T> {
    /// Concatenates the publishers of a cloneable iterable.
    pub fn new<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = BoxPublisher<T>> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::from_cursor_fn(move || Ok(IterCursor::new(sources.clone().into_iter())))
    }

    /// Concatenates the publishers of a cursor produced per subscription.
    ///
    /// A factory error is delivered to the subscriber as `on_error`.
    pub fn from_cursor_fn<C, F>(factory: F) -> Self
    where
        C: SourceCursor<T> + 'static,
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        Self {
            cursors: Arc::new(move || {
                factory().map(|c| Box::new(c) as Box<dyn SourceCursor<T>>)
            }),
            config: StreamConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }
}

impl<T: Send + 'static> Publisher<T> for Concat<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let cursor = match call_guarded(self.config.capture_panics, || (self.cursors)()) {
            Ok(cursor) => cursor,
            Err(err) => {
                error_subscriber(subscriber.as_ref(), err.with_kind(ErrorKind::CursorFault));
                return;
            }
        };
        let parent = ConcatSubscriber::new(subscriber, cursor, self.config.clone());
        parent.downstream.on_subscribe(parent.clone());
        if !parent.arbiter.is_cancelled() {
            parent.drive();
        }
    }
}

/// Concatenates `sources` in order.
///
/// # Examples
///
/// ```ignore
/// use rivulet::stream::{boxed, concat, iter};
///
/// let joined = concat(vec![boxed(iter(vec![1, 2])), boxed(iter(vec![3]))]);
/// ```
pub fn concat<T, I>(sources: I) -> Concat<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = BoxPublisher<T>> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
{
    Concat::new(sources)
}

/// Subscriber installed in each concatenated publisher, and the
/// subscription handed downstream.
struct ConcatSubscriber<T> {
    downstream: Serialized<T>,
    arbiter: SubscriptionArbiter,
    // Only locked by the turn holding `wip`.
    cursor: Mutex<Box<dyn SourceCursor<T>>>,
    wip: AtomicUsize,
    produced: AtomicU64,
    config: StreamConfig,
    this: Weak<Self>,
}

impl<T: Send + 'static> ConcatSubscriber<T> {
    fn new(
        actual: Arc<dyn Subscriber<T>>,
        cursor: Box<dyn SourceCursor<T>>,
        config: StreamConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            downstream: Serialized::new(actual, config.clone()),
            arbiter: SubscriptionArbiter::new(),
            cursor: Mutex::new(cursor),
            wip: AtomicUsize::new(0),
            produced: AtomicU64::new(0),
            config,
            this: this.clone(),
        })
    }

    /// Subscribes to the next publisher, or finishes.
    ///
    /// Runs on construction and on every completion. Only the caller that
    /// moves `wip` from zero loops; everyone else just records that another
    /// pass is needed.
    fn drive(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        loop {
            if self.arbiter.is_cancelled() {
                return;
            }

            let has_more = call_guarded(self.config.capture_panics, || {
                self.cursor.lock().has_more()
            });
            let has_more = match has_more {
                Ok(has_more) => has_more,
                Err(err) => {
                    self.fail_cursor(err);
                    return;
                }
            };

            if self.arbiter.is_cancelled() {
                return;
            }

            if !has_more {
                debug!("concat sequence exhausted");
                self.arbiter.clear();
                self.downstream.on_complete();
                return;
            }

            let next = call_guarded(self.config.capture_panics, || {
                self.cursor.lock().next_source()
            });
            let next = match next {
                Ok(Some(next)) => next,
                Ok(None) => {
                    self.fail_cursor(Error::new(
                        ErrorKind::MissingSource,
                        "the source cursor returned no publisher",
                    ));
                    return;
                }
                Err(err) => {
                    self.fail_cursor(err);
                    return;
                }
            };

            if self.arbiter.is_cancelled() {
                return;
            }

            let produced = self.produced.swap(0, Ordering::Relaxed);
            if produced != 0 {
                trace!(produced, "concat conserving demand before switch");
                self.arbiter.produced(produced);
            }

            next.subscribe(this.clone());

            if self.arbiter.is_cancelled() {
                return;
            }

            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }

    fn fail_cursor(&self, err: Error) {
        let err = match err.kind() {
            ErrorKind::Panicked | ErrorKind::MissingSource => err,
            _ => err.with_kind(ErrorKind::CursorFault),
        };
        debug!(error = %err, "concat cursor failed; abandoning sequence");
        self.arbiter.cancel();
        self.downstream.on_error(err);
    }
}

impl<T: Send + 'static> Subscriber<T> for ConcatSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.arbiter.set(subscription);
    }

    fn on_next(&self, item: T) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: Error) {
        debug!(error = %error, "concat source failed; ending sequence");
        self.arbiter.clear();
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.drive();
    }
}

impl<T: Send + 'static> Subscription for ConcatSubscriber<T> {
    fn request(&self, n: u64) {
        if let Err(err) = self.arbiter.request(n) {
            self.downstream.on_error(err);
        }
    }

    fn cancel(&self) {
        if self.arbiter.cancel() {
            self.downstream.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{boxed, empty, fail, iter, just, never};
    use crate::test_utils::{Counted, TestSubscriber};

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn concat_yields_all_in_order() {
        init_test("concat_yields_all_in_order");
        let joined = concat(vec![
            boxed(iter(vec![1, 2])),
            boxed(empty()),
            boxed(iter(vec![3, 4])),
        ]);
        let ts = TestSubscriber::unbounded();
        ts.subscribe_to(&joined);
        let values = ts.values();
        crate::assert_with_log!(values == vec![1, 2, 3, 4], "values", vec![1, 2, 3, 4], values);
        crate::assert_with_log!(ts.completions() == 1, "one completion", 1, ts.completions());
        crate::test_complete!("concat_yields_all_in_order");
    }

    #[test]
    fn empty_sequence_completes() {
        init_test("empty_sequence_completes");
        let joined = concat(Vec::<BoxPublisher<i32>>::new());
        let ts = TestSubscriber::new(0);
        ts.subscribe_to(&joined);
        crate::assert_with_log!(ts.is_complete(), "complete", true, ts.is_complete());
        crate::test_complete!("empty_sequence_completes");
    }

    #[test]
    fn failure_halts_sequence() {
        init_test("failure_halts_sequence");
        let tail = Counted::new(boxed(just(99)));
        let tail_counters = tail.counters();
        let joined = concat(vec![
            boxed(iter(vec![1, 2])),
            boxed(fail(Error::user("forced failure"))),
            boxed(tail),
        ]);
        let ts = TestSubscriber::unbounded();
        ts.subscribe_to(&joined);
        let values = ts.values();
        crate::assert_with_log!(values == vec![1, 2], "values", vec![1, 2], values);
        let msg = ts.error().map(|e| e.message().to_string());
        crate::assert_with_log!(
            msg.as_deref() == Some("forced failure"),
            "error",
            "forced failure",
            msg
        );
        let subscribes = tail_counters.subscribes();
        crate::assert_with_log!(subscribes == 0, "tail never tried", 0, subscribes);
        crate::test_complete!("failure_halts_sequence");
    }

    #[test]
    fn demand_is_conserved_between_sources() {
        init_test("demand_is_conserved_between_sources");
        let second = Counted::new(boxed(iter(vec![3, 4, 5])));
        let second_counters = second.counters();
        let joined = concat(vec![boxed(iter(vec![1, 2])), boxed(second)]);
        let ts = TestSubscriber::new(3);
        ts.subscribe_to(&joined);
        let values = ts.values();
        crate::assert_with_log!(values == vec![1, 2, 3], "values", vec![1, 2, 3], values);
        let requested = second_counters.requested();
        crate::assert_with_log!(requested == 1, "second asked for 1", 1, requested);
        ts.request(2);
        let values = ts.values();
        crate::assert_with_log!(
            values == vec![1, 2, 3, 4, 5],
            "values",
            vec![1, 2, 3, 4, 5],
            values
        );
        crate::assert_with_log!(ts.is_complete(), "complete", true, ts.is_complete());
        crate::test_complete!("demand_is_conserved_between_sources");
    }

    #[test]
    fn cancel_reaches_active_source_once() {
        init_test("cancel_reaches_active_source_once");
        let silent = Counted::new(boxed(never::<i32>()));
        let counters = silent.counters();
        let joined = concat(vec![boxed(iter(vec![1])), boxed(silent)]);
        let ts = TestSubscriber::unbounded();
        ts.subscribe_to(&joined);
        ts.cancel();
        ts.cancel();
        let cancels = counters.cancels();
        crate::assert_with_log!(cancels == 1, "cancelled once", 1, cancels);
        crate::assert_with_log!(!ts.is_terminated(), "no terminal", false, ts.is_terminated());
        crate::test_complete!("cancel_reaches_active_source_once");
    }

    struct FaultyCursor {
        remaining: usize,
        fault: Fault,
    }

    enum Fault {
        HasMore,
        Next,
        Absent,
        Panic,
    }

    impl SourceCursor<i32> for FaultyCursor {
        fn has_more(&mut self) -> Result<bool> {
            if self.remaining == 0 {
                if matches!(self.fault, Fault::HasMore) {
                    return Err(Error::user("has_more exploded"));
                }
                if matches!(self.fault, Fault::Panic) {
                    panic!("cursor panicked");
                }
            }
            Ok(true)
        }

        fn next_source(&mut self) -> Result<Option<BoxPublisher<i32>>> {
            if self.remaining > 0 {
                self.remaining -= 1;
                return Ok(Some(boxed(just(1))));
            }
            match self.fault {
                Fault::Next => Err(Error::user("next exploded")),
                _ => Ok(None),
            }
        }
    }

    fn run_faulty(fault: Fault) -> Arc<TestSubscriber<i32>> {
        let fault = std::sync::Mutex::new(Some(fault));
        let joined = Concat::from_cursor_fn(move || {
            let fault = fault
                .lock()
                .expect("fault lock poisoned")
                .take()
                .expect("cursor opened twice");
            Ok(FaultyCursor {
                remaining: 2,
                fault,
            })
        });
        let ts = TestSubscriber::unbounded();
        ts.subscribe_to(&joined);
        ts
    }

    #[test]
    fn cursor_faults_become_errors() {
        init_test("cursor_faults_become_errors");
        let cases = [
            (Fault::HasMore, ErrorKind::CursorFault),
            (Fault::Next, ErrorKind::CursorFault),
            (Fault::Absent, ErrorKind::MissingSource),
            (Fault::Panic, ErrorKind::Panicked),
        ];
        for (fault, expected) in cases {
            let ts = run_faulty(fault);
            let values = ts.values();
            crate::assert_with_log!(values == vec![1, 1], "values before fault", vec![1, 1], values);
            let kind = ts.error().map(|e| e.kind());
            crate::assert_with_log!(kind == Some(expected), "fault kind", Some(expected), kind);
            crate::assert_with_log!(ts.error_count() == 1, "one error", 1, ts.error_count());
        }
        crate::test_complete!("cursor_faults_become_errors");
    }

    #[test]
    fn cursor_factory_error_is_delivered() {
        init_test("cursor_factory_error_is_delivered");
        let joined: Concat<i32> = Concat::from_cursor_fn(|| -> Result<FaultyCursor> {
            Err(Error::user("no cursor"))
        });
        let ts = TestSubscriber::unbounded();
        ts.subscribe_to(&joined);
        let kind = ts.error().map(|e| e.kind());
        crate::assert_with_log!(
            kind == Some(ErrorKind::CursorFault),
            "cursor fault",
            Some(ErrorKind::CursorFault),
            kind
        );
        crate::test_complete!("cursor_factory_error_is_delivered");
    }

    #[test]
    fn zero_request_errors_and_cancels_source() {
        init_test("zero_request_errors_and_cancels_source");
        let silent = Counted::new(boxed(never::<i32>()));
        let counters = silent.counters();
        let joined = concat(vec![boxed(silent)]);
        let ts = TestSubscriber::new(0);
        ts.subscribe_to(&joined);
        ts.request(0);
        let kind = ts.error().map(|e| e.kind());
        crate::assert_with_log!(
            kind == Some(ErrorKind::InvalidDemand),
            "invalid demand",
            Some(ErrorKind::InvalidDemand),
            kind
        );
        crate::assert_with_log!(counters.cancels() == 1, "source cancelled", 1, counters.cancels());
        crate::test_complete!("zero_request_errors_and_cancels_source");
    }

    #[test]
    fn concat_is_cold() {
        init_test("concat_is_cold");
        let joined = concat(vec![boxed(just(1)), boxed(just(2))]);
        for _ in 0..3 {
            let ts = TestSubscriber::unbounded();
            ts.subscribe_to(&joined);
            crate::assert_with_log!(ts.values() == vec![1, 2], "values", vec![1, 2], ts.values());
        }
        crate::test_complete!("concat_is_cold");
    }

    #[test]
    fn iter_cursor_debug_needs_no_debug_items() {
        init_test("iter_cursor_debug_needs_no_debug_items");
        let cursor = IterCursor::new(vec![boxed(just(1))].into_iter());
        let shown = format!("{cursor:?}");
        crate::assert_with_log!(shown.starts_with("IterCursor"), "debug output", "IterCursor { .. }", shown);
        crate::test_complete!("iter_cursor_debug_needs_no_debug_items");
    }

    #[test]
    fn finished_driver_releases_its_sources() {
        init_test("finished_driver_releases_its_sources");
        let joined = concat(vec![boxed(iter(vec![1, 2])), boxed(just(3))]);
        let ts = TestSubscriber::unbounded();
        ts.subscribe_to(&joined);
        crate::assert_with_log!(ts.is_complete(), "complete", true, ts.is_complete());
        let driver = ts.subscription().expect("subscribed");
        let weak = Arc::downgrade(&driver);
        drop(driver);
        let refs = Arc::strong_count(&ts);
        crate::assert_with_log!(refs == 1, "downstream released", 1, refs);
        drop(ts);
        let freed = weak.upgrade().is_none();
        crate::assert_with_log!(freed, "driver freed", true, freed);
        crate::test_complete!("finished_driver_releases_its_sources");
    }
}
