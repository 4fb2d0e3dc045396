use kestrel::cache::{PredictionCache, Probe};
use kestrel::config::MAX_CACHE_MOVES;

fn store(cache: &PredictionCache, key: u64, value: f32, priors: &[f32]) {
    let mut scratch = [0f32; MAX_CACHE_MOVES];
    match cache.probe(key, priors.len(), &mut scratch) {
        Probe::Miss { store: Some(handle) } => cache.put(handle, value, priors),
        _ => panic!("expected a storable miss for key {key}"),
    }
}

#[test]
fn round_trip_within_quantization_error() {
    let cache = PredictionCache::with_geometry(4, 32);
    let priors: Vec<f32> = (1..=10).map(|i| i as f32 / 55.0).collect();
    store(&cache, 0x1234_5678_9ABC_DEF0, 0.731, &priors);

    let mut out = [0f32; MAX_CACHE_MOVES];
    match cache.probe(0x1234_5678_9ABC_DEF0, priors.len(), &mut out) {
        Probe::Hit { value } => {
            assert!((value - 0.731).abs() < 1e-6);
            for (read, wrote) in out.iter().zip(&priors) {
                assert!((read - wrote).abs() <= 1.0 / 65535.0 + 1e-6);
            }
        }
        Probe::Miss { .. } => panic!("stored entry must hit"),
    }
    assert_eq!(cache.permille_hits(), 500, "one hit in two probes");
}

#[test]
fn guard_rejects_corrupted_priors() {
    // Store a two-mover, then probe pretending a different move count; the
    // guard quantum makes every such probe a miss.
    let cache = PredictionCache::with_geometry(1, 8);
    store(&cache, 42, 0.5, &[0.5, 0.5]);

    let mut out = [0f32; MAX_CACHE_MOVES];
    for wrong_count in [1usize, 3, 4, 10] {
        assert!(
            matches!(cache.probe(42, wrong_count, &mut out), Probe::Miss { .. }),
            "count {wrong_count} slipped past the guard"
        );
    }
    // The real count still hits.
    assert!(matches!(cache.probe(42, 2, &mut out), Probe::Hit { .. }));
}

#[test]
fn distinct_keys_do_not_alias() {
    let cache = PredictionCache::with_geometry(2, 16);
    store(&cache, 1000, 0.25, &[1.0]);
    store(&cache, 2000, 0.75, &[1.0]);

    let mut out = [0f32; MAX_CACHE_MOVES];
    match cache.probe(1000, 1, &mut out) {
        Probe::Hit { value } => assert!((value - 0.25).abs() < 1e-6),
        _ => panic!("first key lost"),
    }
    match cache.probe(2000, 1, &mut out) {
        Probe::Hit { value } => assert!((value - 0.75).abs() < 1e-6),
        _ => panic!("second key lost"),
    }
}

#[test]
fn clear_and_metrics() {
    let cache = PredictionCache::with_geometry(1, 4);
    store(&cache, 7, 0.5, &[1.0]);
    assert!(cache.permille_full() > 0);
    cache.clear();
    assert_eq!(cache.permille_full(), 0);
    assert_eq!(cache.permille_hits(), 0);
    let mut out = [0f32; MAX_CACHE_MOVES];
    assert!(matches!(cache.probe(7, 1, &mut out), Probe::Miss { .. }));
}

#[test]
fn disabled_cache_always_misses_without_handles() {
    let cache = PredictionCache::new();
    let mut out = [0f32; MAX_CACHE_MOVES];
    match cache.probe(1, 1, &mut out) {
        Probe::Miss { store } => assert!(store.is_none()),
        Probe::Hit { .. } => panic!("unallocated cache cannot hit"),
    }
}
