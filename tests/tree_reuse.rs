use kestrel::cache::PredictionCache;
use kestrel::config::EngineOptions;
use kestrel::engine::Engine;
use kestrel::network::UniformNetwork;
use kestrel::time_control::TimeControl;
use std::sync::Arc;

fn test_engine() -> Engine {
    let mut options = EngineOptions::default();
    options.search_threads = 2;
    options.prediction_batch_size = 8;
    options.slowstart_nodes = 0;
    Engine::with_cache(
        options,
        Arc::new(UniformNetwork),
        None,
        PredictionCache::with_geometry(2, 64),
    )
}

fn nodes(n: u64) -> TimeControl {
    TimeControl {
        nodes: Some(n),
        ..Default::default()
    }
}

#[test]
fn reused_tree_matches_fresh_tree_at_the_new_root() {
    let moves: Vec<String> = ["e2e4", "e7e5"].iter().map(|s| s.to_string()).collect();

    // Search the start position, then push two moves through the same tree.
    let mut reused = test_engine();
    reused.set_position(None, &[]).unwrap();
    reused.go(nodes(300), Vec::new()).unwrap();
    reused.wait_until_finished();
    reused.set_position(None, &moves).unwrap();
    reused.go(nodes(200), Vec::new()).unwrap();
    reused.wait_until_finished();
    let (_, mut reused_moves) = reused.debug_root().expect("expanded root");

    // Same position built from scratch.
    let mut fresh = test_engine();
    fresh.set_position(None, &moves).unwrap();
    fresh.go(nodes(200), Vec::new()).unwrap();
    fresh.wait_until_finished();
    let (_, mut fresh_moves) = fresh.debug_root().expect("expanded root");

    reused_moves.sort();
    fresh_moves.sort();
    assert_eq!(
        reused_moves, fresh_moves,
        "promoted subtree must describe the same position as a fresh tree"
    );
}

#[test]
fn promoted_subtree_keeps_its_visits() {
    let mut engine = test_engine();
    engine.set_position(None, &[]).unwrap();
    engine.go(nodes(500), Vec::new()).unwrap();
    engine.wait_until_finished();
    let (root_visits_before, _) = engine.debug_root().unwrap();
    assert!(root_visits_before >= 500);

    // Advance along one reply pair; the reused root is the old grandchild and
    // keeps whatever visits it accumulated.
    let moves: Vec<String> = ["g1f3", "g8f6"].iter().map(|s| s.to_string()).collect();
    engine.set_position(None, &moves).unwrap();
    if let Some((visits, child_moves)) = engine.debug_root() {
        assert!(visits <= root_visits_before);
        assert!(!child_moves.is_empty());
    }
    // An unexpanded grandchild is also fine; the next search rebuilds it.
}

#[test]
fn unrelated_position_discards_the_tree() {
    let mut engine = test_engine();
    engine.set_position(None, &[]).unwrap();
    engine.go(nodes(200), Vec::new()).unwrap();
    engine.wait_until_finished();
    assert!(engine.debug_root().is_some());

    engine
        .set_position(Some("k7/8/2K5/8/8/8/8/7R w - - 0 1"), &[])
        .unwrap();
    assert!(
        engine.debug_root().is_none(),
        "a fresh position starts from an unexpanded root"
    );
}
