// Criterion benchmarks for the endpoint pool read path.
//
// Run with:
//   cargo bench --bench endpoints_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sd_pool::{
    cache::Built, nop, retry, Balancer, BalancerKind, BoxError, CacheOptions, Context,
    DiscoveryEvent, EndpointCache, Endpointer, Factory, FixedEndpointer,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .try_init();
}

fn populated_cache(instances: usize) -> EndpointCache<(), ()> {
    let factory: Factory<(), ()> =
        Arc::new(|_instance: &str| -> Result<Built<(), ()>, BoxError> { Ok((nop(), None)) });
    let cache = EndpointCache::new(factory, CacheOptions::default());
    cache.update(DiscoveryEvent::from_instances((0..instances).map(|i| format!("10.0.0.{i}:80"))));
    cache
}

fn bench_endpoints(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("endpoints");

    for size in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::new("serial", size), &size, |b, &size| {
            let cache = populated_cache(size);
            b.iter(|| black_box(cache.endpoints().unwrap()));
        });
    }

    group.bench_function("parallel_8_threads", |b| {
        let cache = populated_cache(10);
        b.iter_custom(|iters| {
            let start = Instant::now();
            std::thread::scope(|s| {
                for _ in 0..8 {
                    s.spawn(|| {
                        for _ in 0..iters {
                            black_box(cache.endpoints().unwrap());
                        }
                    });
                }
            });
            start.elapsed()
        });
    });

    group.bench_function("update_same_set", |b| {
        let cache = populated_cache(10);
        let event = DiscoveryEvent::from_instances((0..10).map(|i| format!("10.0.0.{i}:80")));
        b.iter(|| cache.update(black_box(event.clone())));
    });

    group.finish();
}

fn bench_balancers(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancer");
    let endpointer: Arc<dyn Endpointer<(), ()>> =
        Arc::new(FixedEndpointer::new((0..10).map(|_| nop()).collect()));

    for kind in [BalancerKind::RoundRobin, BalancerKind::Random] {
        let balancer = sd_pool::build_balancer(kind, 1, endpointer.clone());
        group.bench_function(kind.to_string(), |b| {
            b.iter(|| black_box(balancer.endpoint().unwrap()))
        });
    }

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let balancer = sd_pool::build_balancer(BalancerKind::RoundRobin, 0, endpointer);
    let retrying = retry(3, Duration::from_secs(1), balancer);
    group.bench_function("retry_call", |b| {
        b.to_async(&runtime).iter(|| retrying.call(Context::background(), ()));
    });

    group.finish();
}

criterion_group!(benches, bench_endpoints, bench_balancers);
criterion_main!(benches);
