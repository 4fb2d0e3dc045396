mod common;

use common::{fresh_root, Harness};
use kestrel::game::Game;
use kestrel::mcts::decay_toward_draw;
use kestrel::node::{Bound, Node, TerminalValue};

fn walk(node: &Node, check: &mut impl FnMut(&Node)) {
    check(node);
    if let Some(children) = node.children() {
        for child in children {
            walk(child, check);
        }
    }
}

#[test]
fn no_value_escapes_a_proven_bound() {
    let harness = Harness::new();
    let root = fresh_root();
    // A mate-rich position: proofs appear quickly and clamp their nodes.
    let game = Game::from_fen("6k1/4Q3/6K1/8/8/8/8/8 w - - 0 1").unwrap();
    harness.search(&root, &game, 4, 1500);

    walk(&root, &mut |node| {
        if node.value_weight() == 0 {
            return;
        }
        let value = node.value();
        assert!((0.0..=1.0).contains(&value), "value {value} out of range");
        // Proofs discovered at expansion time clamp every sample the node
        // ever takes. (Proofs promoted later may coexist with an older
        // average until further visits replay the proven value.)
        match node.terminal() {
            TerminalValue::MateIn(1) => assert_eq!(value, 1.0),
            TerminalValue::Draw => assert_eq!(value, 0.5),
            _ => {}
        }
        if node.terminal() == TerminalValue::NonTerminal {
            match node.bound() {
                Bound::Lower => assert_eq!(value, 1.0),
                Bound::Upper => assert_eq!(value, 0.0),
                Bound::Exact => assert_eq!(value, 0.5),
                Bound::None => {}
            }
        }
    });
}

#[test]
fn decay_pushes_won_positions_toward_draw_with_stale_progress() {
    // A cornered win with an ancient no-progress counter must display below
    // the undecayed bound.
    let raw = 0.95f32;
    let decayed = decay_toward_draw(raw, 0.8, 80, 100.0);
    assert!(decayed < raw);
    assert!(decayed > 0.5, "decay shrinks toward the draw, never past it");

    // Fresh progress decays nothing.
    assert_eq!(decay_toward_draw(raw, 0.8, 0, 100.0), raw);
    // Full material decays nothing either.
    assert_eq!(decay_toward_draw(raw, 0.0, 80, 100.0), raw);
}

#[test]
fn decay_is_symmetric_around_the_draw() {
    let up = decay_toward_draw(0.9, 0.5, 60, 100.0);
    let down = decay_toward_draw(0.1, 0.5, 60, 100.0);
    assert!((up - 0.5 - (0.5 - down)).abs() < 1e-6);
}

#[test]
fn endgame_proportion_reflects_material() {
    let kbn = Game::from_fen("8/8/4k3/8/4K3/4B3/4N3/8 w - - 80 120").unwrap();
    // Knight + bishop = 6 points against a 12-point ceiling.
    let proportion = kbn.endgame_proportion(12);
    assert!((proportion - 0.5).abs() < 1e-6);

    let start = Game::startpos();
    assert_eq!(start.endgame_proportion(12), 0.0);

    let bare = Game::from_fen("8/8/4k3/8/4K3/8/8/8 w - - 0 1").unwrap();
    assert_eq!(bare.endgame_proportion(12), 1.0);
}
