//! Throughput benchmarks for the sequencing drivers.
//!
//! Benchmarks:
//! - Concatenating many synchronously completing sources (the trampoline path)
//! - Concatenating under lock-step demand (arbiter request/produced churn)
//! - Retrying a failing source under a companion stream
//! - Raw arbiter request/set/produced cycles
//!
//! Run:
//!   cargo bench --bench concat_retry_bench

#![allow(missing_docs)]
#![allow(clippy::semicolon_if_nothing_returned)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use rivulet::stream::{
    BoxPublisher, EmptySubscription, Publisher, Subscriber, Subscription, SubscriptionArbiter,
    boxed, concat, fail, just, range, retry_when,
};
use rivulet::{Error, UNBOUNDED};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// HELPERS
// =============================================================================

/// Counts values; requests `batch` up front and again after every `batch`
/// values.
struct CountingSink {
    batch: u64,
    seen: AtomicU64,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

impl CountingSink {
    fn new(batch: u64) -> Arc<Self> {
        Arc::new(Self {
            batch,
            seen: AtomicU64::new(0),
            subscription: Mutex::new(None),
        })
    }
}

impl<T> Subscriber<T> for CountingSink {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.subscription.lock() = Some(Arc::clone(&subscription));
        subscription.request(self.batch);
    }

    fn on_next(&self, item: T) {
        black_box(&item);
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        if self.batch != UNBOUNDED && seen % self.batch == 0 {
            let subscription = self.subscription.lock().clone();
            if let Some(subscription) = subscription {
                subscription.request(self.batch);
            }
        }
    }

    fn on_error(&self, error: Error) {
        black_box(error);
    }

    fn on_complete(&self) {}
}

fn singles(n: u64) -> Vec<BoxPublisher<u64>> {
    (0..n).map(|i| boxed(just(i))).collect()
}

// =============================================================================
// CONCAT BENCHMARKS
// =============================================================================

fn bench_concat_singles(c: &mut Criterion) {
    let mut group = c.benchmark_group("concat/singles");
    for n in [1_000_u64, 10_000, 100_000] {
        group.throughput(Throughput::Elements(n));
        let joined = concat(singles(n));
        for (label, batch) in [("unbounded", UNBOUNDED), ("lock_step", 1)] {
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, _| {
                b.iter(|| {
                    let sink = CountingSink::new(batch);
                    joined.subscribe(sink.clone());
                    black_box(sink.seen.load(Ordering::Relaxed))
                })
            });
        }
    }
    group.finish();
}

// =============================================================================
// RETRY BENCHMARKS
// =============================================================================

fn bench_retry_when(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_when/attempts");
    for attempts in [100_usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(attempts as u64));
        let source = boxed(concat(vec![
            boxed(range(0, 4)),
            boxed(fail(Error::user("bench failure"))),
        ]));
        let retried = retry_when(source, move |_| {
            let companion: BoxPublisher<i64> = boxed(range(0, attempts));
            Ok(Some(companion))
        });
        group.bench_with_input(BenchmarkId::from_parameter(attempts), &attempts, |b, _| {
            b.iter(|| {
                let sink = CountingSink::new(UNBOUNDED);
                retried.subscribe(sink.clone());
                black_box(sink.seen.load(Ordering::Relaxed))
            })
        });
    }
    group.finish();
}

// =============================================================================
// ARBITER BENCHMARKS
// =============================================================================

fn bench_arbiter_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("arbiter/cycle");
    group.bench_function("request_produced_set", |b| {
        let arbiter = SubscriptionArbiter::new();
        let upstream: Arc<dyn Subscription> = Arc::new(EmptySubscription);
        b.iter(|| {
            arbiter.request(black_box(8)).unwrap();
            arbiter.produced(black_box(8));
            arbiter.set(Arc::clone(&upstream));
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_concat_singles,
    bench_retry_when,
    bench_arbiter_cycle
);
criterion_main!(benches);
