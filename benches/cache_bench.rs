use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kestrel::cache::{PredictionCache, Probe};
use kestrel::config::MAX_CACHE_MOVES;

fn bench_cache(c: &mut Criterion) {
    let cache = PredictionCache::with_geometry(8, 1024);
    let priors = [1.0 / 32.0; 32];
    let mut scratch = [0f32; MAX_CACHE_MOVES];
    for key in 0..10_000u64 {
        let spread = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        if let Probe::Miss { store: Some(handle) } = cache.probe(spread, 32, &mut scratch) {
            cache.put(handle, 0.5, &priors);
        }
    }

    c.bench_function("cache_probe_hit", |b| {
        let key = 77u64.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        b.iter(|| {
            let mut out = [0f32; MAX_CACHE_MOVES];
            black_box(cache.probe(black_box(key), 32, &mut out))
        })
    });

    c.bench_function("cache_probe_miss", |b| {
        b.iter(|| {
            let mut out = [0f32; MAX_CACHE_MOVES];
            black_box(cache.probe(black_box(0xDEAD_BEEF), 32, &mut out))
        })
    });
}

criterion_group!(benches, bench_cache);
criterion_main!(benches);
