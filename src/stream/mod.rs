//! Demand-driven publishers and the drivers that compose them.
//!
//! # Core
//!
//! - [`Publisher`], [`Subscriber`], [`Subscription`]: the push protocol.
//! - [`SubscriptionArbiter`]: one downstream across a sequence of upstreams.
//! - [`Concat`]: subscribe to publishers one after another.
//! - [`RetryWhen`]: resubscribe to a source when a companion stream says so.
//!
//! # Sources
//!
//! [`iter`], [`just`], [`range`], [`empty`], [`fail`], [`never`], [`defer`].

mod arbiter;
mod concat;
mod defer;
mod deferred;
mod empty;
mod iter;
mod retry_when;
mod serialized;
mod signaller;
#[allow(clippy::module_inception)]
mod stream;

pub use arbiter::SubscriptionArbiter;
pub use concat::{Concat, IterCursor, SourceCursor, concat};
pub use defer::{Defer, defer};
pub use deferred::DeferredSubscription;
pub use empty::{Empty, Fail, Never, empty, fail, never};
pub use iter::{Iter, iter, just, range};
pub use retry_when::{RetryWhen, retry_when};
pub use signaller::{Control, ControlSink, Signaller};
pub use stream::{
    BoxPublisher, BoxSubscriber, BoxSubscription, EmptySubscription, Publisher, Subscriber,
    Subscription, complete_subscriber, error_subscriber,
};

use std::sync::Arc;

/// Erases the type of a publisher.
pub fn boxed<T, P>(publisher: P) -> BoxPublisher<T>
where
    P: Publisher<T> + 'static,
{
    Arc::new(publisher)
}
