#[macro_use]
extern crate criterion;

use criterion::Criterion;

use kvarn_core::alloc::{LocalCache, Pool, PoolId, PoolParams, PoolTuning};
use kvarn_core::context::RuntimeContext;
use kvarn_core::worker::Worker;
use kvarn_config::RuntimeConfig;

fn bench_pool_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_alloc_free");
    group.throughput(criterion::Throughput::Elements(1));

    let pool = Pool::new(
        PoolId::default(),
        PoolParams::buffer("bench", 4096, 256),
        PoolTuning::default(),
    )
    .unwrap();

    group.bench_function("shared", |b| {
        b.iter(|| {
            let buf = pool.alloc_shared(128).unwrap();
            pool.free_shared(buf).unwrap();
        });
    });

    group.bench_function("local_cache", |b| {
        let mut cache = LocalCache::new(0);
        b.iter(|| {
            let buf = pool.alloc(&mut cache, 128).unwrap();
            pool.free(&mut cache, buf).unwrap();
        });
        pool.flush_cache(&mut cache);
    });

    let packets = Pool::new(
        PoolId::default(),
        PoolParams::packet("segmented", 4096, 512),
        PoolTuning::default(),
    )
    .unwrap();
    group.bench_function("packet_three_segments", |b| {
        let mut cache = LocalCache::new(0);
        b.iter(|| {
            let buf = packets.alloc(&mut cache, 1200).unwrap();
            packets.free(&mut cache, buf).unwrap();
        });
        packets.flush_cache(&mut cache);
    });
    group.finish();
}

fn bench_worker_round_trip(c: &mut Criterion) {
    let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
    let pool = ctx.create_pool(PoolParams::buffer("rt", 1024, 64)).unwrap();
    let mut worker = Worker::new(&ctx).unwrap();

    c.bench_function("worker_alloc_free", |b| {
        b.iter(|| {
            let buf = worker.alloc(pool, 64).unwrap();
            worker.free(buf).unwrap();
        });
    });
}

criterion_group!(benches, bench_pool_alloc_free, bench_worker_round_trip);
criterion_main!(benches);
