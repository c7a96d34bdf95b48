//! Subscription arbiter: one downstream consumer, a sequence of producers.
//!
//! The arbiter owns the current upstream [`Subscription`] and the demand
//! the downstream has granted but the producers have not yet satisfied.
//! Drivers swap producers in with [`SubscriptionArbiter::set`] and report
//! satisfied demand with [`SubscriptionArbiter::produced`]; the next
//! producer is then asked for exactly what is still outstanding.
//!
//! # Concurrency
//!
//! Every operation may be called from any thread. Mutations are serialized
//! by a `wip` counter instead of a lock: the caller that moves `wip` from
//! zero owns the arbiter state for the duration of its turn. Callers that
//! lose the race park their contribution in a `missed_*` field and leave;
//! the owner folds it in before releasing. Upstream `request`/`cancel`
//! calls are always made after the turn is released, so producers that
//! emit synchronously re-enter cleanly.
//!
//! # State machine
//!
//! `INIT -> ACTIVE* -> (CANCELLED | CLEARED)`. Once cancelled, the active
//! subscription is cancelled exactly once and every later `set` cancels its
//! argument. Cleared is the normal end after a terminal signal: the active
//! subscription is dropped without a `cancel`, which breaks the reference
//! cycle between a driver and the producer it is subscribed to.

use crate::error::Result;
use crate::stream::BoxSubscription;
use crate::tracing_compat::{trace, warn};
use crate::types::{Demand, UNBOUNDED, add_cap, sub_floor, validate_request};
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// A lock-free cell holding at most one subscription.
struct SubscriptionCell {
    slot: ArrayQueue<BoxSubscription>,
}

impl SubscriptionCell {
    fn new() -> Self {
        Self {
            slot: ArrayQueue::new(1),
        }
    }

    /// Stores `s`, returning the previous occupant.
    fn replace(&self, s: BoxSubscription) -> Option<BoxSubscription> {
        self.slot.force_push(s)
    }

    fn take(&self) -> Option<BoxSubscription> {
        self.slot.pop()
    }

    /// Returns a handle to the occupant. Only the turn owner may call this.
    fn current(&self) -> Option<BoxSubscription> {
        let s = self.slot.pop()?;
        let handle = BoxSubscription::clone(&s);
        let _ = self.slot.force_push(s);
        Some(handle)
    }

    fn is_empty(&self) -> bool {
        self.slot.is_empty()
    }
}

/// Multiplexes one logical downstream across a time-sequence of producers.
pub struct SubscriptionArbiter {
    wip: AtomicUsize,
    cancelled: AtomicBool,
    cleared: AtomicBool,
    // Owned by the turn holding `wip`.
    active: SubscriptionCell,
    requested: AtomicU64,
    unbounded: AtomicBool,
    // Hand-off from turns that lost the race.
    missed_subscription: SubscriptionCell,
    missed_requested: Demand,
    missed_produced: Demand,
}

impl SubscriptionArbiter {
    /// Creates an arbiter with no subscription and no outstanding demand.
    #[must_use]
    pub fn new() -> Self {
        Self {
            wip: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            cleared: AtomicBool::new(false),
            active: SubscriptionCell::new(),
            requested: AtomicU64::new(0),
            unbounded: AtomicBool::new(false),
            missed_subscription: SubscriptionCell::new(),
            missed_requested: Demand::new(),
            missed_produced: Demand::new(),
        }
    }

    /// Grants `n` more units of demand.
    ///
    /// Forwarded to the active subscription if there is one, otherwise kept
    /// until the next [`set`](Self::set). `n == 0` is a protocol violation:
    /// the arbiter cancels itself and the error is returned for delivery
    /// downstream.
    pub fn request(&self, n: u64) -> Result<()> {
        if let Err(err) = validate_request(n) {
            warn!(n, "invalid demand; cancelling arbiter");
            self.cancel();
            return Err(err);
        }
        if self.unbounded.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.try_enter() {
            let r = self.requested.load(Ordering::Relaxed);
            if r != UNBOUNDED {
                let r = add_cap(r, n);
                self.requested.store(r, Ordering::Relaxed);
                if r == UNBOUNDED {
                    self.unbounded.store(true, Ordering::Release);
                }
            }
            let active = self.active.current();
            self.leave();
            if let Some(active) = active {
                active.request(n);
            }
            return Ok(());
        }
        self.missed_requested.add(n);
        self.drain();
        Ok(())
    }

    /// Installs `subscription` as the active one.
    ///
    /// The previous subscription is dropped, not cancelled: drivers only
    /// swap after the previous producer has terminated. All outstanding
    /// demand is forwarded to the new subscription. If the arbiter is
    /// already cancelled, `subscription` is cancelled instead.
    pub fn set(&self, subscription: BoxSubscription) {
        if self.is_closed() {
            subscription.cancel();
            return;
        }
        if self.try_enter() {
            let _previous = self.active.replace(BoxSubscription::clone(&subscription));
            if self.is_closed() {
                // A cancel or clear finished between the check above and this turn.
                let installed = self.active.take();
                self.leave();
                if let Some(installed) = installed {
                    installed.cancel();
                }
                return;
            }
            let r = self.requested.load(Ordering::Relaxed);
            self.leave();
            trace!(outstanding = r, "arbiter swapped subscription");
            if r != 0 {
                subscription.request(r);
            }
            return;
        }
        let _previous = self.missed_subscription.replace(subscription);
        self.drain();
    }

    /// Records that `n` units were delivered by the producer being retired.
    ///
    /// Drivers call this right before [`set`](Self::set) so the next
    /// producer is not asked again for demand that is already satisfied.
    pub fn produced(&self, n: u64) {
        if n == 0 || self.unbounded.load(Ordering::Acquire) {
            return;
        }
        if self.try_enter() {
            let r = self.requested.load(Ordering::Relaxed);
            if r == UNBOUNDED {
                self.unbounded.store(true, Ordering::Release);
            } else {
                let (left, overflow) = sub_floor(r, n);
                if overflow {
                    warn!(requested = r, produced = n, "more produced than requested");
                }
                self.requested.store(left, Ordering::Relaxed);
            }
            self.leave();
            return;
        }
        self.missed_produced.add(n);
        self.drain();
    }

    /// Cancels the arbiter and its active subscription.
    ///
    /// Returns `true` for the call that performed the cancellation; every
    /// later call is a no-op returning `false`.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        trace!("arbiter cancelled");
        self.drain();
        true
    }

    /// Releases the subscriptions after a terminal signal.
    ///
    /// The active subscription is dropped without being cancelled, since
    /// its producer has already terminated; a subscription still waiting
    /// to be installed is cancelled. Every later [`set`](Self::set) cancels
    /// its argument and demand is no longer forwarded.
    pub fn clear(&self) {
        if self.cleared.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("arbiter cleared");
        self.drain();
    }

    /// Returns `true` once [`clear`](Self::clear) has been called.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.is_cancelled() || self.is_cleared()
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `true` once the downstream has requested unbounded demand.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.unbounded.load(Ordering::Acquire)
    }

    /// Snapshot of outstanding demand, excluding contributions still
    /// parked by concurrent callers.
    #[must_use]
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Returns `true` if a subscription is currently installed.
    #[must_use]
    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    fn try_enter(&self) -> bool {
        self.wip
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Ends a fast-path turn, draining whatever arrived meanwhile.
    fn leave(&self) {
        if self.wip.fetch_sub(1, Ordering::AcqRel) != 1 {
            self.drain_loop();
        }
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        self.drain_loop();
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        let mut request_amount = 0_u64;
        let mut request_target: Option<BoxSubscription> = None;

        loop {
            let ms = self.missed_subscription.take();
            let mr = self.missed_requested.take();
            let mp = self.missed_produced.take();

            if self.is_cancelled() {
                if let Some(active) = self.active.take() {
                    active.cancel();
                }
                if let Some(ms) = ms {
                    ms.cancel();
                }
                request_target = None;
            } else if self.is_cleared() {
                let _finished = self.active.take();
                if let Some(ms) = ms {
                    ms.cancel();
                }
                request_target = None;
            } else {
                let mut r = self.requested.load(Ordering::Relaxed);
                if r != UNBOUNDED {
                    let u = add_cap(r, mr);
                    if u == UNBOUNDED {
                        r = UNBOUNDED;
                        self.unbounded.store(true, Ordering::Release);
                    } else {
                        let (left, overflow) = sub_floor(u, mp);
                        if overflow {
                            warn!(requested = u, produced = mp, "more produced than requested");
                        }
                        r = left;
                    }
                    self.requested.store(r, Ordering::Relaxed);
                }

                if let Some(ms) = ms {
                    let _previous = self.active.replace(BoxSubscription::clone(&ms));
                    request_amount = r;
                    request_target = (r != 0).then_some(ms);
                } else if mr != 0 {
                    if let Some(active) = self.active.current() {
                        request_amount = add_cap(request_amount, mr);
                        request_target = Some(active);
                    }
                }
            }

            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                if let Some(target) = request_target {
                    if request_amount != 0 {
                        target.request(request_amount);
                    }
                }
                return;
            }
            missed = remaining;
        }
    }
}

impl Default for SubscriptionArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionArbiter")
            .field("cancelled", &self.is_cancelled())
            .field("cleared", &self.is_cleared())
            .field("requested", &self.requested())
            .field("unbounded", &self.is_unbounded())
            .field("has_active", &self.has_active())
            .finish_non_exhaustive()
    }
}
