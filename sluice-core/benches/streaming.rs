use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sluice_core::{ConnectionScope, MemoryEngine, PageSource, QueryCache, RowStream};
use tokio::runtime::Runtime;

const TABLE_ROWS: usize = 10_000;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_row_stream(c: &mut Criterion) {
    let engine = Arc::new(MemoryEngine::with_sample_users(TABLE_ROWS));
    let rt = runtime();
    let mut group = c.benchmark_group("RowStream::next_batch");
    group.throughput(Throughput::Elements(TABLE_ROWS as u64));

    for fetch_size in [1usize, 10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(fetch_size), &fetch_size, |b, &k| {
            b.to_async(&rt).iter(|| {
                let engine = Arc::clone(&engine);
                async move {
                    let mut stream = RowStream::open(engine.as_ref(), "SELECT * FROM user_data", &[], k)
                        .await
                        .unwrap();
                    let mut count = 0;
                    while let Some(batch) = stream.next_batch().await.unwrap() {
                        count += batch.len();
                    }
                    black_box(count)
                }
            });
        });
    }
    group.finish();
}

fn bench_lazy_pages(c: &mut Criterion) {
    let engine = Arc::new(MemoryEngine::with_sample_users(TABLE_ROWS));
    let pages = PageSource::new(ConnectionScope::new(engine), "SELECT * FROM user_data", Vec::new());
    let rt = runtime();

    c.bench_function("LazyPages::walk_100", |b| {
        b.to_async(&rt).iter(|| async {
            let mut walk = pages.lazy_pages(100).unwrap();
            let mut count = 0;
            while let Some(page) = walk.next_page().await.unwrap() {
                count += page.len();
            }
            black_box(count)
        });
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let engine = Arc::new(MemoryEngine::with_sample_users(1_000));
    let scope = ConnectionScope::new(engine);
    let cache = QueryCache::new();
    let rt = runtime();
    rt.block_on(cache.fetch(&scope, "SELECT * FROM user_data", &[]))
        .unwrap();

    c.bench_function("QueryCache::fetch_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let rows = cache.fetch(&scope, "SELECT * FROM user_data", &[]).await.unwrap();
            black_box(rows.len())
        });
    });
}

criterion_group!(benches, bench_row_stream, bench_lazy_pages, bench_cache_hit);
criterion_main!(benches);
