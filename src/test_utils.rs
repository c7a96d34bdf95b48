//! Test helpers: logging setup, assertion macros, and recording subscribers.
//!
//! Compiled for unit tests and, with the `test-internals` feature, for
//! integration tests.

use crate::error::Error;
use crate::stream::{
    BoxPublisher, BoxSubscriber, BoxSubscription, Publisher, Subscriber, Subscription,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static INIT_LOGGING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `rivulet=debug`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rivulet=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Marks the start of a test phase in the log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        ::tracing::info!(phase = %$name, "========== TEST PHASE ==========");
    };
}

/// Marks a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        ::tracing::debug!(section = %$name, "---------- section ----------");
    };
}

/// Marks successful completion of a test in the log.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        ::tracing::info!(test = %$name, "test completed");
    };
}

/// Asserts a condition, logging expected and actual values first.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $what:expr, $expected:expr, $actual:expr) => {{
        let cond = $cond;
        ::tracing::debug!(
            check = %$what,
            expected = ?$expected,
            actual = ?$actual,
            ok = cond,
            "assertion"
        );
        assert!(
            cond,
            "{}: expected {:?}, got {:?}",
            $what,
            $expected,
            $actual
        );
    }};
}

/// A subscriber that records everything it receives.
///
/// Requests `initial_request` units on subscribe (none when zero) and,
/// if configured, `request_on_next` more after every value.
pub struct TestSubscriber<T> {
    initial_request: u64,
    request_on_next: u64,
    subscription: Mutex<Option<BoxSubscription>>,
    subscribe_calls: AtomicUsize,
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<Error>>,
    completions: AtomicUsize,
    signals_after_terminal: AtomicUsize,
    cancel_pending: AtomicBool,
    pending_request: AtomicU64,
}

impl<T> TestSubscriber<T> {
    /// Creates a subscriber requesting `initial_request` on subscribe.
    ///
    /// Pass [`UNBOUNDED`](crate::types::UNBOUNDED) to request everything.
    #[must_use]
    pub fn new(initial_request: u64) -> Arc<Self> {
        Self::build(initial_request, 0)
    }

    /// Creates a subscriber requesting everything on subscribe.
    #[must_use]
    pub fn unbounded() -> Arc<Self> {
        Self::build(crate::types::UNBOUNDED, 0)
    }

    /// Creates a subscriber that requests `n` on subscribe and `n` more
    /// from inside every `on_next`.
    #[must_use]
    pub fn lock_step(n: u64) -> Arc<Self> {
        Self::build(n, n)
    }

    fn build(initial_request: u64, request_on_next: u64) -> Arc<Self> {
        Arc::new(Self {
            initial_request,
            request_on_next,
            subscription: Mutex::new(None),
            subscribe_calls: AtomicUsize::new(0),
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            signals_after_terminal: AtomicUsize::new(0),
            cancel_pending: AtomicBool::new(false),
            pending_request: AtomicU64::new(0),
        })
    }

    /// Subscribes this subscriber to `publisher`.
    pub fn subscribe_to<P>(self: &Arc<Self>, publisher: &P)
    where
        P: Publisher<T> + ?Sized,
        T: Send + 'static,
    {
        let subscriber: BoxSubscriber<T> = Arc::clone(self) as BoxSubscriber<T>;
        publisher.subscribe(subscriber);
    }

    /// Requests `n` more values.
    ///
    /// Before the subscription arrives the amount is remembered and
    /// forwarded on subscribe.
    pub fn request(&self, n: u64) {
        let subscription = self.subscription.lock().clone();
        match subscription {
            Some(s) => s.request(n),
            None => {
                self.pending_request.fetch_add(n, Ordering::SeqCst);
            }
        }
    }

    /// Cancels the subscription.
    pub fn cancel(&self) {
        let subscription = self.subscription.lock().clone();
        match subscription {
            Some(s) => s.cancel(),
            None => self.cancel_pending.store(true, Ordering::SeqCst),
        }
    }

    /// Returns the subscription received, if any.
    #[must_use]
    pub fn subscription(&self) -> Option<BoxSubscription> {
        self.subscription.lock().clone()
    }

    /// Returns how many times `on_subscribe` was called.
    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of values received.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns the first error received.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.errors.lock().first().cloned()
    }

    /// Returns how many errors were received.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    /// Returns `true` if `on_complete` was received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completions.load(Ordering::SeqCst) > 0
    }

    /// Returns how many times `on_complete` was received.
    #[must_use]
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// Returns `true` if a terminal signal was received.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.is_complete() || self.error_count() > 0
    }

    /// Returns how many signals arrived after a terminal signal.
    ///
    /// Anything other than zero is a protocol violation by the producer.
    #[must_use]
    pub fn signals_after_terminal(&self) -> usize {
        self.signals_after_terminal.load(Ordering::SeqCst)
    }

    fn note_if_terminated(&self) {
        if self.is_terminated() {
            self.signals_after_terminal.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl<T: Clone> TestSubscriber<T> {
    /// Returns a copy of the values received so far.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }
}

impl<T: Send> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.subscribe_calls.fetch_add(1, Ordering::SeqCst) > 0 {
            subscription.cancel();
            self.errors.lock().push(Error::duplicate_subscription());
            return;
        }
        *self.subscription.lock() = Some(Arc::clone(&subscription));
        if self.cancel_pending.load(Ordering::SeqCst) {
            subscription.cancel();
            return;
        }
        let pending = self.pending_request.swap(0, Ordering::SeqCst);
        let initial = self.initial_request.saturating_add(pending);
        if initial > 0 {
            subscription.request(initial);
        }
    }

    fn on_next(&self, item: T) {
        self.note_if_terminated();
        self.values.lock().push(item);
        if self.request_on_next > 0 {
            self.request(self.request_on_next);
        }
    }

    fn on_error(&self, error: Error) {
        self.note_if_terminated();
        self.errors.lock().push(error);
    }

    fn on_complete(&self) {
        self.note_if_terminated();
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counters recorded by a [`Counted`].
#[derive(Debug, Default)]
pub struct PublisherCounters {
    subscribes: AtomicUsize,
    cancels: AtomicUsize,
    requests: AtomicUsize,
    requested: AtomicU64,
}

impl PublisherCounters {
    /// Number of times the counted publisher was subscribed.
    #[must_use]
    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Number of `cancel` calls that reached the counted publisher.
    #[must_use]
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Number of `request` calls that reached the counted publisher.
    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Sum of all demand requested from the counted publisher (saturating).
    #[must_use]
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Wraps a publisher and counts subscribe, request, and cancel traffic.
pub struct Counted<T> {
    inner: Arc<dyn Publisher<T>>,
    counters: Arc<PublisherCounters>,
}

impl<T: Send + 'static> Counted<T> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Publisher<T>>) -> Self {
        Self {
            inner,
            counters: Arc::new(PublisherCounters::default()),
        }
    }

    /// Returns the shared counters.
    #[must_use]
    pub fn counters(&self) -> Arc<PublisherCounters> {
        Arc::clone(&self.counters)
    }
}

impl<T: Send + 'static> Publisher<T> for Counted<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe(Arc::new(CountedSubscriber {
            actual: subscriber,
            counters: Arc::clone(&self.counters),
        }));
    }
}

struct CountedSubscriber<T> {
    actual: Arc<dyn Subscriber<T>>,
    counters: Arc<PublisherCounters>,
}

impl<T: Send> Subscriber<T> for CountedSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.actual.on_subscribe(Arc::new(CountedSubscription {
            actual: subscription,
            counters: Arc::clone(&self.counters),
        }));
    }

    fn on_next(&self, item: T) {
        self.actual.on_next(item);
    }

    fn on_error(&self, error: Error) {
        self.actual.on_error(error);
    }

    fn on_complete(&self) {
        self.actual.on_complete();
    }
}

struct CountedSubscription {
    actual: Arc<dyn Subscription>,
    counters: Arc<PublisherCounters>,
}

impl Subscription for CountedSubscription {
    fn request(&self, n: u64) {
        self.counters.requests.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .counters
            .requested
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
                Some(r.saturating_add(n))
            });
        self.actual.request(n);
    }

    fn cancel(&self) {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
        self.actual.cancel();
    }
}

/// How a [`ScriptedCompanion`] answers one source failure.
#[derive(Debug, Clone)]
pub enum Reaction {
    /// Emit a value: the source is retried.
    Retry,
    /// Complete the companion.
    Complete,
    /// Fail the companion with this error.
    Fail(Error),
}

/// A companion stream answering each failure with the next scripted
/// [`Reaction`]. Failures past the end of the script complete it.
pub struct ScriptedCompanion {
    failures: BoxPublisher<Error>,
    script: Vec<Reaction>,
}

impl ScriptedCompanion {
    /// Scripts the companion built over `failures`.
    #[must_use]
    pub fn new(failures: BoxPublisher<Error>, script: Vec<Reaction>) -> Self {
        Self { failures, script }
    }
}

impl Publisher<()> for ScriptedCompanion {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<()>>) {
        self.failures.subscribe(Arc::new(ScriptedSubscriber {
            actual: subscriber,
            script: Mutex::new(self.script.iter().cloned().collect()),
            upstream: Mutex::new(None),
            done: AtomicBool::new(false),
        }));
    }
}

struct ScriptedSubscriber {
    actual: Arc<dyn Subscriber<()>>,
    script: Mutex<VecDeque<Reaction>>,
    upstream: Mutex<Option<BoxSubscription>>,
    done: AtomicBool,
}

impl ScriptedSubscriber {
    fn finish(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        let upstream = self.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        true
    }
}

impl Subscriber<Error> for ScriptedSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.upstream.lock() = Some(Arc::clone(&subscription));
        self.actual.on_subscribe(subscription);
    }

    fn on_next(&self, _failure: Error) {
        if self.done.load(Ordering::SeqCst) {
            return;
        }
        let reaction = self.script.lock().pop_front().unwrap_or(Reaction::Complete);
        match reaction {
            Reaction::Retry => self.actual.on_next(()),
            Reaction::Complete => {
                if self.finish() {
                    self.actual.on_complete();
                }
            }
            Reaction::Fail(error) => {
                if self.finish() {
                    self.actual.on_error(error);
                }
            }
        }
    }

    fn on_error(&self, error: Error) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.actual.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.actual.on_complete();
        }
    }
}
