mod common;

use common::{fresh_root, Harness};
use kestrel::game::Game;
use kestrel::mcts::{select_move, seeded_rng, PlayMode};
use kestrel::node::TerminalValue;

#[test]
fn finds_mate_in_one() {
    // White: Qe7, Kg6. Black: Kg8. Qe8 and Qg7 both mate.
    let harness = Harness::new();
    let root = fresh_root();
    let game = Game::from_fen("6k1/4Q3/6K1/8/8/8/8/8 w - - 0 1").unwrap();

    harness.search(&root, &game, 4, 800);

    let best = root.best_child().expect("searched root has a best child");
    assert_eq!(
        best.terminal(),
        TerminalValue::MateIn(1),
        "best child must be a proven mate in one"
    );

    let mut rng = seeded_rng();
    let (_, mv) = select_move(&root, &game, &harness.options, PlayMode::Search, &mut rng)
        .expect("a move must be selected");
    let mated = {
        let mut after = game.clone();
        after.apply_move(mv);
        after.is_checkmate()
    };
    assert!(mated, "selected move {mv} does not deliver mate");
}

#[test]
fn proves_mate_in_two_through_the_tree() {
    // White: Kc6, Rh1. Black: Ka8. 1.Kb6 Kb8 2.Rh8#.
    let harness = Harness::new();
    let root = fresh_root();
    let game = Game::from_fen("k7/8/2K5/8/8/8/8/7R w - - 0 1").unwrap();

    harness.search(&root, &game, 8, 8000);

    let best = root.best_child().expect("best child exists");
    match best.terminal() {
        TerminalValue::MateIn(distance) => {
            assert!(distance <= 2, "proved mate must be within two moves");
        }
        other => panic!("expected a proven mate at the root, got {other:?}"),
    }
    // The proof must rest on an all-replies-lose subtree two plies down.
    assert_eq!(root.terminal(), TerminalValue::OpponentMateIn(best_distance(&root)));
}

fn best_distance(root: &kestrel::node::Node) -> u8 {
    match root.best_child().unwrap().terminal() {
        TerminalValue::MateIn(distance) => distance,
        _ => unreachable!(),
    }
}

#[test]
fn mate_in_one_reported_before_everything_else() {
    // Mate term dominates: with very few simulations the mating move still
    // collects the proof once its leaf is expanded.
    let harness = Harness::new();
    let root = fresh_root();
    let game = Game::from_fen("6k1/4Q3/6K1/8/8/8/8/8 w - - 0 1").unwrap();

    harness.search(&root, &game, 4, 2000);
    let children = root.children().unwrap();
    let mates = children
        .iter()
        .filter(|c| c.terminal() == TerminalValue::MateIn(1))
        .count();
    assert!(mates >= 1, "at least one mating child must be proven");
    // Root flagged as lost for the side that just moved (black).
    assert_eq!(root.terminal(), TerminalValue::OpponentMateIn(1));
}
