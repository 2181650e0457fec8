use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use orderflow_core::Price;
use orderflow_pipeline::PriceAggregator;
use std::sync::Arc;
use std::thread;

const ADDS_PER_THREAD: u64 = 10_000;

fn price(cents: u64) -> Price {
    Price::from_cents(cents).unwrap()
}

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregator_single_thread");
    group.throughput(Throughput::Elements(1));

    let agg = PriceAggregator::with_report_every(u64::MAX);
    group.bench_function("add_price", |b| {
        let mut cents = 1u64;
        b.iter(|| {
            cents = cents % 100_000 + 1;
            black_box(agg.add_price(price(cents)))
        });
    });

    group.bench_function("snapshot", |b| b.iter(|| black_box(agg.snapshot())));
    group.finish();
}

/// Contended additions: every worker hammers the same lock.
fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregator_contended");

    for threads in [1u64, 2, 4, 8] {
        group.throughput(Throughput::Elements(threads * ADDS_PER_THREAD));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let agg = Arc::new(PriceAggregator::with_report_every(u64::MAX));
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let agg = Arc::clone(&agg);
                        thread::spawn(move || {
                            for i in 0..ADDS_PER_THREAD {
                                agg.add_price(price(t * ADDS_PER_THREAD + i + 1));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                black_box(agg.snapshot())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_thread, bench_contended);
criterion_main!(benches);
