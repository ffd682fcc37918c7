#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, Criterion};
use spate_cache::{Lookup, PageCache};
use spate_types::{ByteOffset, CacheConfig, CachePolicyKind, FileId, PageLocation, PAGE_SIZE};

const FRAMES: usize = 1024;

fn cache(policy: CachePolicyKind) -> PageCache {
    PageCache::new(&CacheConfig {
        policy,
        cache_size: (FRAMES * PAGE_SIZE) as u64,
        ..CacheConfig::default()
    })
    .expect("cache")
}

fn page(n: u64) -> PageLocation {
    PageLocation::containing(FileId(0), ByteOffset(n * PAGE_SIZE as u64))
}

fn fill(cache: &PageCache, loc: PageLocation) {
    match cache.search(loc).expect("search") {
        Lookup::Miss { frame } => {
            let buf = cache.take_read_payload(frame);
            cache.install_payload(frame, buf);
            cache.release(frame);
        }
        Lookup::Hit { frame, .. } => cache.release(frame),
        Lookup::Writeback(_) => unreachable!("read-only bench"),
    }
}

fn bench_hit_path(c: &mut Criterion) {
    for (name, policy) in [
        ("lru2q", CachePolicyKind::Lru2q),
        ("associative", CachePolicyKind::Associative),
    ] {
        let cache = cache(policy);
        for n in 0..FRAMES as u64 {
            fill(&cache, page(n));
        }
        let mut n = 0_u64;
        c.bench_function(&format!("hit/{name}"), |b| {
            b.iter(|| {
                n = (n + 1) % FRAMES as u64;
                let Lookup::Hit { frame, .. } = cache.search(black_box(page(n))).unwrap() else {
                    panic!("warm cache must hit");
                };
                cache.release(frame);
            });
        });
    }
}

fn bench_miss_evict_cycle(c: &mut Criterion) {
    for (name, policy) in [
        ("lru2q", CachePolicyKind::Lru2q),
        ("associative", CachePolicyKind::Associative),
    ] {
        let cache = cache(policy);
        let mut n = 0_u64;
        c.bench_function(&format!("miss_evict/{name}"), |b| {
            b.iter(|| {
                n += 1;
                fill(&cache, black_box(page(n)));
            });
        });
    }
}

fn bench_metrics_snapshot(c: &mut Criterion) {
    let cache = cache(CachePolicyKind::Lru2q);
    for n in 0..FRAMES as u64 {
        fill(&cache, page(n));
    }
    c.bench_function("metrics_snapshot", |b| {
        b.iter(|| black_box(cache.metrics()));
    });
}

criterion_group!(
    cache_benches,
    bench_hit_path,
    bench_miss_evict_cycle,
    bench_metrics_snapshot,
);

fn main() {
    cache_benches();
    Criterion::default().configure_from_args().final_summary();
}
