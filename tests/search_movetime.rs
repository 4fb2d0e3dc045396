use kestrel::cache::PredictionCache;
use kestrel::config::EngineOptions;
use kestrel::engine::Engine;
use kestrel::network::UniformNetwork;
use kestrel::time_control::TimeControl;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_engine(threads: usize) -> Engine {
    let mut options = EngineOptions::default();
    options.search_threads = threads;
    options.prediction_batch_size = 8;
    options.slowstart_nodes = 0;
    Engine::with_cache(
        options,
        Arc::new(UniformNetwork),
        None,
        PredictionCache::with_geometry(2, 64),
    )
}

#[test]
fn movetime_stops_the_search_near_budget() {
    let mut engine = test_engine(2);
    engine.set_position(None, &[]).unwrap();

    let start = Instant::now();
    engine.go(TimeControl::movetime(300), Vec::new()).unwrap();
    engine.wait_until_finished();
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(280),
        "stopped early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1500),
        "stopped far too late: {elapsed:?}"
    );
    let (visits, _) = engine.debug_root().expect("root searched");
    assert!(visits > 0);
}

#[test]
fn stop_interrupts_an_infinite_search() {
    let mut engine = test_engine(2);
    engine.set_position(None, &[]).unwrap();
    engine.go(TimeControl::infinite(), Vec::new()).unwrap();
    std::thread::sleep(Duration::from_millis(150));

    let start = Instant::now();
    engine.stop();
    engine.wait();
    assert!(
        start.elapsed() < Duration::from_millis(1000),
        "stop must interrupt promptly"
    );
    assert!(engine.debug_root().is_some());
}

#[test]
fn node_budget_caps_the_search() {
    let mut engine = test_engine(1);
    engine.set_position(None, &[]).unwrap();
    engine
        .go(
            TimeControl {
                nodes: Some(64),
                ..Default::default()
            },
            Vec::new(),
        )
        .unwrap();
    engine.wait_until_finished();
    let (visits, _) = engine.debug_root().unwrap();
    assert!(visits >= 64, "budget must be reached before stopping");
    assert!(visits < 64 + 512, "budget overshoot bounded by in-flight work");
}
