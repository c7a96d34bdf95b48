//! A set-once subscription slot.
//!
//! Holds the place of a subscription that has not arrived yet. Demand and
//! cancellation issued early are replayed onto the subscription when it is
//! set. Once cancelled or released the slot lets go of the subscription.

use super::{BoxSubscription, Subscription};
use crate::error::{Error, Result};
use crate::tracing_compat::{trace, warn};
use crate::types::{Demand, validate_request};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

struct Slot {
    subscription: Option<BoxSubscription>,
    closed: bool,
}

/// A subscription that can be set exactly once.
///
/// Requests made before [`set`](Self::set) accumulate and are forwarded in
/// one call on arrival. A [`cancel`](Subscription::cancel) before arrival
/// cancels the subscription as soon as it is set. Either way the upstream
/// sees at most one `cancel`.
pub struct DeferredSubscription {
    // Locked only to read or swap the handle, never across upstream calls.
    slot: Mutex<Slot>,
    pending: Demand,
    arrived: AtomicBool,
    cancelled: AtomicBool,
}

impl DeferredSubscription {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                subscription: None,
                closed: false,
            }),
            pending: Demand::new(),
            arrived: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Sets the subscription.
    ///
    /// A second call cancels its argument and returns
    /// [`ErrorKind::DuplicateSubscription`](crate::error::ErrorKind::DuplicateSubscription).
    /// If the slot was already cancelled or released, the subscription is
    /// cancelled on arrival.
    pub fn set(&self, subscription: BoxSubscription) -> Result<()> {
        if self.arrived.swap(true, Ordering::SeqCst) {
            warn!("subscription already set; cancelling the newcomer");
            subscription.cancel();
            return Err(Error::duplicate_subscription());
        }
        {
            let mut slot = self.slot.lock();
            if !slot.closed {
                slot.subscription = Some(BoxSubscription::clone(&subscription));
                drop(slot);
                self.flush_pending(&subscription);
                return Ok(());
            }
        }
        trace!("slot closed before the subscription arrived");
        subscription.cancel();
        Ok(())
    }

    /// Lets go of the subscription without cancelling it.
    ///
    /// Used once the upstream has terminated on its own. Later requests
    /// are ignored and a late [`set`](Self::set) cancels its argument.
    pub fn release(&self) {
        let released = {
            let mut slot = self.slot.lock();
            slot.closed = true;
            slot.subscription.take()
        };
        drop(released);
    }

    /// Returns `true` once a subscription has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.arrived.load(Ordering::SeqCst)
    }

    /// Returns `true` once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `true` while the slot holds a subscription.
    #[must_use]
    pub fn is_holding(&self) -> bool {
        self.slot.lock().subscription.is_some()
    }

    fn current(&self) -> Option<BoxSubscription> {
        self.slot.lock().subscription.clone()
    }

    fn flush_pending(&self, subscription: &BoxSubscription) {
        let r = self.pending.take();
        if r != 0 {
            subscription.request(r);
        }
    }
}

impl Default for DeferredSubscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription for DeferredSubscription {
    /// Invalid demand is ignored here; callers validate before forwarding.
    fn request(&self, n: u64) {
        if validate_request(n).is_err() || self.is_cancelled() {
            return;
        }
        let current = {
            let slot = self.slot.lock();
            if slot.subscription.is_none() {
                if !slot.closed {
                    // Flushed by `set`, which stores under the same lock.
                    self.pending.add(n);
                }
                return;
            }
            slot.subscription.clone()
        };
        if let Some(subscription) = current {
            subscription.request(n);
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = {
            let mut slot = self.slot.lock();
            slot.closed = true;
            slot.subscription.take()
        };
        if let Some(subscription) = cancelled {
            subscription.cancel();
        }
    }
}

impl fmt::Debug for DeferredSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredSubscription")
            .field("set", &self.is_set())
            .field("holding", &self.current().is_some())
            .field("pending", &self.pending.get())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
