//! Resubscribe to a source under the control of a companion stream.
//!
//! [`RetryWhen`] hides the failures of its source from the downstream.
//! Each failure is published as a value on a failure stream; a
//! user-supplied factory turns that stream into a companion stream whose
//! signals decide what happens next:
//!
//! | companion signal | effect                                        |
//! |------------------|-----------------------------------------------|
//! | `on_next`        | subscribe to the source again                 |
//! | `on_complete`    | complete downstream                           |
//! | `on_error(e)`    | fail downstream with `e`, not the source error |
//!
//! The companion is subscribed before the source. If it terminates during
//! its own subscription the source is never subscribed at all.
//!
//! Attempts share one [`SubscriptionArbiter`], so demand a failed attempt
//! did not consume carries over to the next one.

use super::arbiter::SubscriptionArbiter;
use super::serialized::Serialized;
use super::signaller::{Control, ControlSink, Signaller};
use super::{BoxPublisher, Publisher, Subscriber, Subscription};
use crate::config::StreamConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, trace};
use crate::util::call_guarded;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

type CompanionFactory<C> =
    Arc<dyn Fn(BoxPublisher<Error>) -> Result<Option<BoxPublisher<C>>> + Send + Sync>;

/// A publisher that retries its source when a companion stream says so.
///
/// Created by [`retry_when`] or [`RetryWhen::new`].
#[must_use = "publishers do nothing unless subscribed"]
pub struct RetryWhen<T, C> {
    source: BoxPublisher<T>,
    factory: CompanionFactory<C>,
    config: StreamConfig,
}

impl<T, C> RetryWhen<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    /// Retries `source` under the companion built by `factory`.
    ///
    /// The factory runs once per subscription and receives the failure
    /// stream of that subscription. Returning `Err` or `Ok(None)` fails
    /// the subscriber without subscribing to the source.
    pub fn new<F>(source: BoxPublisher<T>, factory: F) -> Self
    where
        F: Fn(BoxPublisher<Error>) -> Result<Option<BoxPublisher<C>>> + Send + Sync + 'static,
    {
        Self {
            source,
            factory: Arc::new(factory),
            config: StreamConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }
}

impl<T, C> Publisher<T> for RetryWhen<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let main = RetryWhenMain::<T, C>::new(subscriber, self.source.clone(), self.config.clone());
        main.downstream.on_subscribe(main.clone());

        let failures: BoxPublisher<Error> = main.signaller.clone();
        let companion = call_guarded(self.config.capture_panics, || (self.factory)(failures));
        let companion = match companion {
            Ok(Some(companion)) => companion,
            Ok(None) => {
                main.terminate(Err(Error::new(
                    ErrorKind::MissingCompanion,
                    "the companion factory returned no publisher",
                )));
                return;
            }
            Err(err) => {
                let err = match err.kind() {
                    ErrorKind::Panicked => err,
                    _ => err.with_kind(ErrorKind::CompanionFactory),
                };
                main.terminate(Err(err));
                return;
            }
        };

        companion.subscribe(main.signaller.clone());

        if !main.arbiter.is_cancelled() && !main.is_done() {
            trace!("subscribing to source");
            self.source.subscribe(main);
        }
    }
}

/// Retries `source` under the companion built by `factory`.
///
/// # Examples
///
/// ```ignore
/// use rivulet::stream::{boxed, iter, retry_when};
///
/// // Retry at most three times.
/// let retried = retry_when(flaky, |_failures| Ok(Some(boxed(iter(0..3)))));
/// ```
pub fn retry_when<T, C, F>(source: BoxPublisher<T>, factory: F) -> RetryWhen<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
    F: Fn(BoxPublisher<Error>) -> Result<Option<BoxPublisher<C>>> + Send + Sync + 'static,
{
    RetryWhen::new(source, factory)
}

/// Subscriber installed in each attempt, and the subscription handed
/// downstream.
struct RetryWhenMain<T, C> {
    downstream: Serialized<T>,
    arbiter: SubscriptionArbiter,
    source: BoxPublisher<T>,
    signaller: Arc<Signaller<C>>,
    wip: AtomicUsize,
    produced: AtomicU64,
    done: AtomicBool,
    config: StreamConfig,
    this: Weak<Self>,
}

impl<T, C> RetryWhenMain<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn new(actual: Arc<dyn Subscriber<T>>, source: BoxPublisher<T>, config: StreamConfig) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let sink: Weak<dyn ControlSink> = this.clone();
            Self {
                downstream: Serialized::new(actual, config.clone()),
                arbiter: SubscriptionArbiter::new(),
                source,
                signaller: Signaller::new(sink),
                wip: AtomicUsize::new(0),
                produced: AtomicU64::new(0),
                done: AtomicBool::new(false),
                config,
                this: this.clone(),
            }
        })
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Subscribes to the source again, iteratively.
    ///
    /// An attempt that fails during `subscribe` while the companion answers
    /// synchronously asks for the next attempt before this call returns;
    /// that request only bumps `wip` and the loop below runs the attempt.
    fn resubscribe(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        loop {
            if self.arbiter.is_cancelled() || self.is_done() {
                return;
            }

            let produced = self.produced.swap(0, Ordering::Relaxed);
            if produced != 0 {
                trace!(produced, "retry conserving demand before resubscribe");
                self.arbiter.produced(produced);
            }

            trace!("resubscribing to source");
            self.source.subscribe(this.clone());

            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }

    /// Delivers the terminal signal once, after tearing down the source
    /// and the companion. A companion that already terminated has been
    /// released and sees no `cancel`.
    fn terminate(&self, outcome: Result<()>) {
        if self.done.swap(true, Ordering::AcqRel) {
            if let Err(err) = outcome {
                self.config.report_error_dropped(&err);
            }
            return;
        }
        self.arbiter.cancel();
        self.signaller.cancel_companion();
        match outcome {
            Ok(()) => {
                debug!("retry finished; completing");
                self.downstream.on_complete();
            }
            Err(err) => {
                debug!(error = %err, "retry failed; erroring");
                self.downstream.on_error(err);
            }
        }
    }
}

impl<T, C> Subscriber<T> for RetryWhenMain<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.arbiter.set(subscription);
    }

    fn on_next(&self, item: T) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: Error) {
        if self.is_done() || self.arbiter.is_cancelled() {
            self.config.report_error_dropped(&error);
            return;
        }
        trace!(error = %error, "source failed; consulting companion");
        self.signaller.request_companion(1);
        self.signaller.signal(error);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("source completed");
        self.arbiter.clear();
        self.signaller.cancel_companion();
        self.downstream.on_complete();
    }
}

impl<T, C> ControlSink for RetryWhenMain<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn control(&self, control: Control) {
        match control {
            Control::Retry => self.resubscribe(),
            Control::Finish => self.terminate(Ok(())),
            Control::Fail(err) => self.terminate(Err(err)),
        }
    }
}

impl<T, C> Subscription for RetryWhenMain<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn request(&self, n: u64) {
        if let Err(err) = self.arbiter.request(n) {
            self.terminate(Err(err));
        }
    }

    fn cancel(&self) {
        if self.arbiter.cancel() {
            trace!("retry cancelled downstream");
            self.signaller.cancel_companion();
            self.downstream.release();
        }
    }
}
