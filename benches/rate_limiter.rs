use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rdap_enrichment::core::RateLimiter;

fn rate_limiter_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    // A bucket large enough that acquisition never waits, so this
    // measures the uncontended fast path.
    c.bench_function("token_acquire_uncontended", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let limiter = RateLimiter::new(1_000_000.0, 1_000);
                for _ in 0..100 {
                    limiter.acquire().await;
                }
                black_box(&limiter);
            })
        })
    });
}

criterion_group!(benches, rate_limiter_benchmark);
criterion_main!(benches);
