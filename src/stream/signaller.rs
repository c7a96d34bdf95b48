//! The bridge between a retrying source and its companion stream.
//!
//! The [`Signaller`] has two faces. Toward the companion factory it is a
//! `Publisher<Error>`: every failure of the source is published on it as a
//! value. Toward the companion stream the factory builds from it, it is a
//! `Subscriber<C>`: each value, completion, or error of the companion is
//! turned into a [`Control`] verdict and sent to the driver.
//!
//! The two sides meet through a single slot. At most one failure waits for
//! demand on the failure stream; a newer failure replaces it.

use super::deferred::DeferredSubscription;
use super::{BoxSubscriber, Publisher, Subscriber, Subscription, error_subscriber};
use crate::error::{Error, ErrorKind};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{Demand, validate_request};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A verdict of the companion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// The companion emitted a value: subscribe to the source again.
    Retry,
    /// The companion completed: complete downstream.
    Finish,
    /// The companion failed: fail downstream with this error.
    Fail(Error),
}

/// Receives the companion's verdicts.
pub trait ControlSink: Send + Sync {
    /// Acts on `control`.
    fn control(&self, control: Control);
}

/// Publishes source failures and relays companion verdicts.
///
/// Accepts a single subscriber on its failure side; a second one receives
/// a [`DuplicateSubscription`](ErrorKind::DuplicateSubscription) error.
pub struct Signaller<C> {
    sink: Weak<dyn ControlSink>,
    companion: DeferredSubscription,
    // Subscriber of the failure stream. Locked only to clone or clear it.
    failures: Mutex<Option<BoxSubscriber<Error>>>,
    subscribed: AtomicBool,
    failures_cancelled: AtomicBool,
    pending: ArrayQueue<Error>,
    demand: Demand,
    wip: AtomicUsize,
    this: Weak<Self>,
    _companion: PhantomData<fn(C)>,
}

impl<C: Send + 'static> Signaller<C> {
    /// Creates a signaller reporting to `sink`.
    pub fn new(sink: Weak<dyn ControlSink>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sink,
            companion: DeferredSubscription::new(),
            failures: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            failures_cancelled: AtomicBool::new(false),
            pending: ArrayQueue::new(1),
            demand: Demand::new(),
            wip: AtomicUsize::new(0),
            this: this.clone(),
            _companion: PhantomData,
        })
    }

    /// Publishes a source failure on the failure stream.
    ///
    /// Delivered once the failure stream has demand. An undelivered
    /// earlier failure is replaced.
    pub fn signal(&self, error: Error) {
        if self.pending.force_push(error).is_some() {
            trace!("replacing undelivered failure");
        }
        self.drain();
    }

    /// Asks the companion stream for `n` more verdicts.
    pub fn request_companion(&self, n: u64) {
        self.companion.request(n);
    }

    /// Cancels the companion subscription and releases the failure
    /// stream's subscriber. Only the first call reaches the companion.
    pub fn cancel_companion(&self) {
        self.companion.cancel();
        self.release();
    }

    /// Drops the failure stream's subscriber and any undelivered failure.
    fn release(&self) {
        self.failures_cancelled.store(true, Ordering::Release);
        let _released = self.failures.lock().take();
        while self.pending.pop().is_some() {}
    }

    fn send(&self, control: Control) {
        match self.sink.upgrade() {
            Some(sink) => sink.control(control),
            None => {
                trace!("driver gone; dropping companion verdict");
            }
        }
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.failures_cancelled.load(Ordering::Acquire) && self.demand.get() != 0 {
                let subscriber = self.failures.lock().clone();
                if let Some(subscriber) = subscriber {
                    if let Some(error) = self.pending.pop() {
                        self.demand.produced(1);
                        subscriber.on_next(error);
                    }
                }
            }
            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                return;
            }
            missed = remaining;
        }
    }
}

impl<C: Send + 'static> Publisher<Error> for Signaller<C> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Error>>) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            warn!("failure stream subscribed twice");
            error_subscriber(subscriber.as_ref(), Error::duplicate_subscription());
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        *self.failures.lock() = Some(Arc::clone(&subscriber));
        subscriber.on_subscribe(this);
        self.drain();
    }
}

impl<C: Send + 'static> Subscription for Signaller<C> {
    fn request(&self, n: u64) {
        if let Err(err) = validate_request(n) {
            warn!(n, "invalid demand on the failure stream");
            self.cancel_companion();
            self.send(Control::Fail(err));
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        trace!("failure stream cancelled");
        self.release();
    }
}

impl<C: Send + 'static> Subscriber<C> for Signaller<C> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if let Err(err) = self.companion.set(subscription) {
            self.send(Control::Fail(err));
        }
    }

    fn on_next(&self, _item: C) {
        trace!("companion emitted; retrying");
        self.send(Control::Retry);
    }

    fn on_error(&self, error: Error) {
        debug!(error = %error, "companion failed");
        self.release();
        self.companion.release();
        let error = match error.kind() {
            ErrorKind::User | ErrorKind::Upstream => error.with_kind(ErrorKind::Companion),
            _ => error,
        };
        self.send(Control::Fail(error));
    }

    fn on_complete(&self) {
        debug!("companion completed");
        self.release();
        self.companion.release();
        self.send(Control::Finish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestSubscriber;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[derive(Default)]
    struct Recorder {
        controls: Mutex<Vec<Control>>,
    }

    impl ControlSink for Recorder {
        fn control(&self, control: Control) {
            self.controls.lock().push(control);
        }
    }

    fn signaller_for(recorder: &Arc<Recorder>) -> Arc<Signaller<Error>> {
        let sink: Arc<dyn ControlSink> = recorder.clone();
        Signaller::new(Arc::downgrade(&sink))
    }

    #[test]
    fn failures_wait_for_demand() {
        init_test("failures_wait_for_demand");
        let recorder = Arc::new(Recorder::default());
        let signaller = signaller_for(&recorder);
        let ts = TestSubscriber::<Error>::new(0);
        ts.subscribe_to(signaller.as_ref());

        signaller.signal(Error::user("first"));
        signaller.signal(Error::user("second"));
        crate::assert_with_log!(ts.value_count() == 0, "held back", 0, ts.value_count());

        ts.request(5);
        let messages: Vec<String> = ts.values().iter().map(|e| e.message().to_string()).collect();
        crate::assert_with_log!(
            messages == vec!["second".to_string()],
            "only the latest is kept",
            vec!["second"],
            messages
        );

        signaller.signal(Error::user("third"));
        crate::assert_with_log!(ts.value_count() == 2, "delivered", 2, ts.value_count());
        crate::test_complete!("failures_wait_for_demand");
    }

    #[test]
    fn companion_signals_become_controls() {
        init_test("companion_signals_become_controls");
        let recorder = Arc::new(Recorder::default());
        let signaller = signaller_for(&recorder);
        signaller.on_next(Error::user("x"));
        signaller.on_error(Error::user("forced failure"));
        signaller.on_complete();
        let controls = recorder.controls.lock().clone();
        crate::assert_with_log!(controls.len() == 3, "three verdicts", 3, controls.len());
        crate::assert_with_log!(controls[0] == Control::Retry, "retry", Control::Retry, &controls[0]);
        match &controls[1] {
            Control::Fail(err) => {
                crate::assert_with_log!(
                    err.kind() == ErrorKind::Companion && err.message() == "forced failure",
                    "retagged companion failure",
                    "Companion: forced failure",
                    err
                );
            }
            other => panic!("expected Fail, got {other:?}"),
        }
        crate::assert_with_log!(controls[2] == Control::Finish, "finish", Control::Finish, &controls[2]);
        crate::test_complete!("companion_signals_become_controls");
    }

    #[test]
    fn second_failure_subscriber_is_rejected() {
        init_test("second_failure_subscriber_is_rejected");
        let recorder = Arc::new(Recorder::default());
        let signaller = signaller_for(&recorder);
        let first = TestSubscriber::<Error>::new(1);
        let second = TestSubscriber::<Error>::new(1);
        first.subscribe_to(signaller.as_ref());
        second.subscribe_to(signaller.as_ref());
        let kind = second.error().map(|e| e.kind());
        crate::assert_with_log!(
            kind == Some(ErrorKind::DuplicateSubscription),
            "duplicate",
            Some(ErrorKind::DuplicateSubscription),
            kind
        );
        crate::assert_with_log!(first.error_count() == 0, "first intact", 0, first.error_count());
        crate::test_complete!("second_failure_subscriber_is_rejected");
    }

    #[test]
    fn zero_demand_on_failure_stream_fails_driver() {
        init_test("zero_demand_on_failure_stream_fails_driver");
        let recorder = Arc::new(Recorder::default());
        let signaller = signaller_for(&recorder);
        let ts = TestSubscriber::<Error>::new(0);
        ts.subscribe_to(signaller.as_ref());
        ts.request(0);
        let controls = recorder.controls.lock().clone();
        let failed = matches!(
            controls.as_slice(),
            [Control::Fail(err)] if err.kind() == ErrorKind::InvalidDemand
        );
        crate::assert_with_log!(failed, "invalid demand verdict", true, controls);
        crate::test_complete!("zero_demand_on_failure_stream_fails_driver");
    }

    #[test]
    fn cancelling_a_self_fed_companion_frees_the_signaller() {
        init_test("cancelling_a_self_fed_companion_frees_the_signaller");
        let recorder = Arc::new(Recorder::default());
        let signaller = signaller_for(&recorder);
        // The failure stream used directly as the companion.
        Publisher::subscribe(signaller.as_ref(), signaller.clone());
        let held = Arc::strong_count(&signaller);
        crate::assert_with_log!(held > 1, "linked to itself", "> 1", held);

        signaller.cancel_companion();
        let refs = Arc::strong_count(&signaller);
        crate::assert_with_log!(refs == 1, "links dropped", 1, refs);
        crate::test_complete!("cancelling_a_self_fed_companion_frees_the_signaller");
    }

    #[test]
    fn companion_completion_releases_its_subscription() {
        init_test("companion_completion_releases_its_subscription");
        let recorder = Arc::new(Recorder::default());
        let signaller = signaller_for(&recorder);
        let upstream = Arc::new(crate::stream::EmptySubscription);
        Subscriber::on_subscribe(signaller.as_ref(), upstream.clone());
        signaller.on_complete();
        let refs = Arc::strong_count(&upstream);
        crate::assert_with_log!(refs == 1, "companion subscription dropped", 1, refs);
        crate::test_complete!("companion_completion_releases_its_subscription");
    }
}
