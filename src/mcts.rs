use chess::ChessMove;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::{PredictionCache, Probe, StoreHandle};
use crate::config::{EngineOptions, MAX_CACHE_MOVES, MAX_GAME_PLIES};
use crate::encoder::{
    encode_position, gather_logits, quantize_probability, softmax, InputPlanes, INPUT_SIZE,
};
use crate::game::{decode_move, encode_move, flip_value, Game, RepetitionDraw, VALUE_DRAW};
use crate::node::{Expansion, Node, TerminalValue, MAX_MATE_PLIES};
use crate::puct::PuctScorer;
use crate::tablebase::Tablebase;

/// Minimax rollback constants: a child is considered at all only when it
/// holds a meaningful share of its parent's visits, and only well-visited
/// nodes recurse instead of returning their own average.
const MINIMAX_VISIT_RATIO: u64 = 64;
const MINIMAX_RECURSE_VISITS: u32 = 256;

static THREAD_SEED: AtomicU32 = AtomicU32::new(0);

/// Per-thread engine, seeded from wall time plus a process-wide counter.
pub fn seeded_rng() -> SmallRng {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(0);
    let counter = THREAD_SEED.fetch_add(1, Ordering::Relaxed) as u64;
    SmallRng::seed_from_u64(nanos ^ counter.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Process-wide counters for one search, shared across workers.
pub struct SearchStats {
    pub node_count: AtomicU64,
    pub failed_node_count: AtomicU64,
    pub tablebase_hit_count: AtomicU64,
    principal_variation_changed: AtomicBool,
    elimination_fraction: AtomicU32,
}

impl SearchStats {
    pub fn new() -> Self {
        Self {
            node_count: AtomicU64::new(0),
            failed_node_count: AtomicU64::new(0),
            tablebase_hit_count: AtomicU64::new(0),
            principal_variation_changed: AtomicBool::new(false),
            elimination_fraction: AtomicU32::new(0f32.to_bits()),
        }
    }

    pub fn reset(&self) {
        self.node_count.store(0, Ordering::Relaxed);
        self.failed_node_count.store(0, Ordering::Relaxed);
        self.tablebase_hit_count.store(0, Ordering::Relaxed);
        self.principal_variation_changed.store(false, Ordering::Relaxed);
        self.elimination_fraction.store(0f32.to_bits(), Ordering::Relaxed);
    }

    /// Release-store by best-chain updaters; the PV printer's acquire-load
    /// synchronizes the chain of `best_index` writes it is about to walk.
    pub fn mark_pv_changed(&self) {
        self.principal_variation_changed.store(true, Ordering::Release);
    }

    pub fn take_pv_changed(&self) -> bool {
        self.principal_variation_changed.swap(false, Ordering::Acquire)
    }

    pub fn set_elimination_fraction(&self, fraction: f32) {
        self.elimination_fraction
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn elimination_fraction(&self) -> f32 {
        f32::from_bits(self.elimination_fraction.load(Ordering::Relaxed))
    }
}

impl Default for SearchStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an MCTS iteration reads besides the tree itself.
pub struct SearchContext<'a> {
    pub options: &'a EngineOptions,
    pub cache: &'a PredictionCache,
    pub tablebase: Option<&'a Tablebase>,
    pub stats: &'a SearchStats,
    /// Search mode probes the cache at any ply; self-play stops at
    /// `cache_max_ply` so late-game noise does not wash out the table.
    pub searching: bool,
    /// Root move filter from the protocol; empty means unrestricted.
    pub search_moves: &'a [ChessMove],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Working,
    WaitingForPrediction,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MctsOutcome {
    /// One simulation completed (expansion, terminal visit, or cache hit).
    Completed,
    /// Another thread owns the leaf; the path was unwound.
    NotReady,
    /// The slot's image wants a network evaluation.
    WaitingForPrediction,
}

#[derive(Clone, Copy)]
struct NodeRef(*const Node);

unsafe impl Send for NodeRef {}
unsafe impl Sync for NodeRef {}

impl NodeRef {
    #[inline]
    fn get(&self) -> &Node {
        // Nodes live until the tree is pruned, which only happens between
        // searches with no slot in flight.
        unsafe { &*self.0 }
    }
}

struct PathEntry {
    node: NodeRef,
    /// Index of this node within its parent's child array; unused at root.
    child_index: u8,
    /// Backpropagation weight of the selection that entered this node.
    weight: u32,
}

/// One parallel simulation slot: the captured continuation of an iteration
/// that yielded for a network prediction.
pub struct SearchSlot {
    pub state: SlotState,
    pub image: InputPlanes,
    scratch: Option<Game>,
    path: Vec<PathEntry>,
    pending_moves: Vec<ChessMove>,
    cache_store: Option<StoreHandle>,
    logits: Vec<f32>,
    cached_priors: Vec<f32>,
}

impl SearchSlot {
    pub fn new() -> Self {
        Self {
            state: SlotState::Working,
            image: [0f32; INPUT_SIZE],
            scratch: None,
            path: Vec::with_capacity(64),
            pending_moves: Vec::new(),
            cache_store: None,
            logits: Vec::new(),
            cached_priors: vec![0f32; MAX_CACHE_MOVES],
        }
    }

    pub fn reset(&mut self) {
        self.state = SlotState::Working;
        self.scratch = None;
        self.path.clear();
        self.pending_moves.clear();
        self.cache_store = None;
    }

    /// Unwind an iteration interrupted by finalization: in-flight visit
    /// counts come back down and a claimed expansion is released.
    pub fn interrupt(&mut self) {
        if self.state == SlotState::WaitingForPrediction {
            if let Some(entry) = self.path.last() {
                entry.node.get().cancel_expansion();
            }
            for entry in &self.path {
                entry.node.get().abandon_visit();
            }
        }
        self.reset();
    }
}

impl Default for SearchSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one MCTS iteration on a slot. When the slot was waiting, `prediction`
/// carries the network's (value, policy logits) for the captured leaf and the
/// iteration resumes at `finish_expanding`.
pub fn run_mcts(
    ctx: &SearchContext,
    root: &Node,
    root_game: &Game,
    slot: &mut SearchSlot,
    prediction: Option<(f32, &[f32])>,
) -> MctsOutcome {
    if slot.state == SlotState::WaitingForPrediction {
        let (value, policy) = prediction.expect("waiting slot resumed without a prediction");
        return resume_with_prediction(ctx, root, slot, value, policy);
    }

    let mut scratch = root_game.snapshot();
    slot.path.clear();
    root.begin_visit();
    slot.path.push(PathEntry {
        node: NodeRef(root),
        child_index: 0,
        weight: 1,
    });

    // Descend until an unexpanded node, accumulating selection weights.
    let mut node: &Node = root;
    while node.expansion() == Expansion::Expanded {
        if scratch.ply_to_search_root() as usize >= MAX_GAME_PLIES {
            let outcome = backpropagate(ctx, root, &slot.path, &scratch, VALUE_DRAW);
            update_best_child_chain(ctx, &slot.path);
            return outcome;
        }
        let children = node.children().expect("expanded node without children");
        let selection = PuctScorer::new(
            node,
            children,
            ctx.options,
            root.virtual_visit_count(),
            ctx.stats.elimination_fraction(),
        )
        .select_child();

        let Some(index) = selection.best else {
            return fail_path(ctx, slot);
        };
        let child = &children[index];
        scratch.apply_move(decode_move(child.encoded_move()));
        child.begin_visit();
        slot.path.push(PathEntry {
            node: NodeRef(child),
            child_index: index as u8,
            weight: selection.backprop_weight,
        });
        node = child;
    }

    // A leaf already known terminal just replays its value.
    let leaf = slot.path.last().unwrap().node.get();
    if let Some(value) = leaf.terminal().value() {
        let outcome = backpropagate(ctx, root, &slot.path, &scratch, value);
        update_best_child_chain(ctx, &slot.path);
        return outcome;
    }

    if !leaf.try_begin_expansion() {
        return fail_path(ctx, slot);
    }

    expand_and_evaluate(ctx, root, slot, scratch)
}

/// First half of an expansion: terminal detection, draw rules, cache probe.
/// Either completes the iteration locally or captures the continuation and
/// asks for a prediction.
fn expand_and_evaluate(
    ctx: &SearchContext,
    root: &Node,
    slot: &mut SearchSlot,
    scratch: Game,
) -> MctsOutcome {
    let leaf = slot.path.last().unwrap().node;
    let leaf = leaf.get();

    let moves = scratch.legal_moves();
    if moves.is_empty() {
        let terminal = if scratch.in_check() {
            TerminalValue::MateIn(1)
        } else {
            TerminalValue::Draw
        };
        leaf.set_terminal(terminal);
        leaf.cancel_expansion();
        let value = terminal.value().unwrap();
        let outcome = backpropagate(ctx, root, &slot.path, &scratch, value);
        if terminal == TerminalValue::MateIn(1) {
            backpropagate_mate(&slot.path);
        }
        update_best_child_chain(ctx, &slot.path);
        return outcome;
    }

    if scratch.is_rule50_draw() || scratch.repetition_draw() == RepetitionDraw::Threefold {
        leaf.set_terminal(TerminalValue::Draw);
        leaf.cancel_expansion();
        let outcome = backpropagate(ctx, root, &slot.path, &scratch, VALUE_DRAW);
        update_best_child_chain(ctx, &slot.path);
        return outcome;
    }

    // A repeat strictly inside the search path scores as a draw for this
    // descent only; the node stays unexpanded and unmarked because the
    // repetition may no longer exist once the root advances.
    if scratch.repetition_draw() == RepetitionDraw::TwofoldAfterRoot {
        leaf.cancel_expansion();
        let outcome = backpropagate(ctx, root, &slot.path, &scratch, VALUE_DRAW);
        update_best_child_chain(ctx, &slot.path);
        return outcome;
    }

    slot.cache_store = None;
    let cache_eligible = moves.len() <= MAX_CACHE_MOVES
        && (ctx.searching || scratch.ply() <= ctx.options.cache_max_ply);
    if cache_eligible {
        match ctx.cache.probe(scratch.key(), moves.len(), &mut slot.cached_priors) {
            Probe::Hit { value } => {
                // Cached values are for the side to move; the node wants the
                // mover's perspective.
                let value = flip_value(value);
                let priors = slot.cached_priors[..moves.len()].to_vec();
                let value = finish_expanding(ctx, slot, &scratch, value, &moves, &priors);
                let outcome = backpropagate(ctx, root, &slot.path, &scratch, value);
                update_best_child_chain(ctx, &slot.path);
                return outcome;
            }
            Probe::Miss { store } => slot.cache_store = store,
        }
    }

    slot.image = encode_position(scratch.board(), scratch.rule50_count());
    slot.pending_moves = moves;
    slot.scratch = Some(scratch);
    slot.state = SlotState::WaitingForPrediction;
    MctsOutcome::WaitingForPrediction
}

fn resume_with_prediction(
    ctx: &SearchContext,
    root: &Node,
    slot: &mut SearchSlot,
    value: f32,
    policy: &[f32],
) -> MctsOutcome {
    slot.state = SlotState::Working;
    let scratch = slot.scratch.take().expect("waiting slot without scratch");
    let moves = std::mem::take(&mut slot.pending_moves);

    // Logits for the legal moves, softmaxed into priors.
    let mut logits = std::mem::take(&mut slot.logits);
    gather_logits(policy, &moves, &mut logits);
    softmax(&mut logits);

    if let Some(handle) = slot.cache_store.take() {
        ctx.cache.put(handle, value, &logits);
    }

    let value = flip_value(value);
    let value = finish_expanding(ctx, slot, &scratch, value, &moves, &logits);
    slot.logits = logits;

    let outcome = backpropagate(ctx, root, &slot.path, &scratch, value);
    update_best_child_chain(ctx, &slot.path);
    outcome
}

/// Second half of an expansion: build and publish the child array, seed
/// first-play urgency, apply the root move filter, probe tablebases.
/// Returns the leaf's value from the parent's perspective, clamped to any
/// tablebase bound discovered here.
fn finish_expanding(
    ctx: &SearchContext,
    slot: &mut SearchSlot,
    scratch: &Game,
    mut value: f32,
    moves: &[ChessMove],
    priors: &[f32],
) -> f32 {
    let leaf = slot.path.last().unwrap().node.get();
    let at_root = slot.path.len() == 1;

    let mut encoded: Vec<(u16, u16)> = Vec::with_capacity(moves.len());
    if at_root && !ctx.search_moves.is_empty() {
        // Restrict the root to the requested moves and renormalize.
        let mut kept: Vec<(ChessMove, f32)> = moves
            .iter()
            .zip(priors)
            .filter(|(mv, _)| ctx.search_moves.contains(mv))
            .map(|(&mv, &p)| (mv, p))
            .collect();
        if kept.is_empty() {
            kept = moves.iter().zip(priors).map(|(&mv, &p)| (mv, p)).collect();
        }
        let total: f32 = kept.iter().map(|(_, p)| p).sum();
        let uniform = 1.0 / kept.len() as f32;
        for (mv, p) in kept {
            let renormalized = if total > 0.0 { p / total } else { uniform };
            encoded.push((encode_move(mv), quantize_probability(renormalized)));
        }
    } else {
        for (&mv, &p) in moves.iter().zip(priors) {
            encoded.push((encode_move(mv), quantize_probability(p)));
        }
    }

    let fpu = if at_root {
        ctx.options.fpu_root
    } else {
        ctx.options.fpu_default
    };

    if let Some(tablebase) = ctx.tablebase {
        if let Some(wdl) = tablebase.probe_wdl(scratch.board(), scratch.rule50_count()) {
            let bound = wdl.bound_for_parent();
            leaf.set_rank_bound(leaf.tablebase_rank(), bound);
            ctx.stats.tablebase_hit_count.fetch_add(1, Ordering::Relaxed);
            if let Some(score) = bound.score() {
                value = score;
            }
        }
    }

    leaf.publish_children(Node::build_children(&encoded, fpu));
    value
}

/// Walk the path tail to head: repair in-flight counts, fold the value into
/// the averages of every node whose selection deserved it, and apply the
/// draw-sibling urgency rule.
fn backpropagate(
    ctx: &SearchContext,
    root: &Node,
    path: &[PathEntry],
    scratch: &Game,
    mut value: f32,
) -> MctsOutcome {
    let leaf = path.last().unwrap().node.get();

    // Progress decay: unproven values drift toward the draw as the no-progress
    // counter climbs, so a won endgame does not shuffle its win away.
    if leaf.bound() == crate::node::Bound::None && leaf.terminal() == TerminalValue::NonTerminal {
        value = decay_toward_draw(
            value,
            scratch.endgame_proportion(ctx.options.endgame_material_max),
            scratch.rule50_count(),
            ctx.options.progress_decay_divisor,
        );
    }

    // Root value expressed in the leaf's perspective, used to reseed siblings
    // on a surprise draw.
    let root_value_for_leaf = if (path.len() - 1) % 2 == 0 {
        root.value()
    } else {
        flip_value(root.value())
    };

    let mut running_weight = 1u32;
    for (depth, entry) in path.iter().enumerate().rev() {
        let node = entry.node.get();
        node.complete_visit();
        running_weight &= entry.weight;

        if running_weight == 1 {
            value = node.bounded_value(value);
            let new_weight = node.sample_value(
                value,
                ctx.options.moving_average_build,
                ctx.options.moving_average_cap,
            );

            // Draw-sibling urgency: the first sample coming back as an exact
            // draw reseeds untouched siblings with the root value, and the
            // surprise is forgiven for every ancestor.
            let is_leaf = depth == path.len() - 1;
            if is_leaf && value == VALUE_DRAW && new_weight == 1 && path.len() >= 2 {
                let parent = path[path.len() - 2].node.get();
                let expected_fpu = if path.len() == 2 {
                    ctx.options.fpu_root
                } else {
                    ctx.options.fpu_default
                };
                if let Some(siblings) = parent.children() {
                    for (index, sibling) in siblings.iter().enumerate() {
                        if index != entry.child_index as usize {
                            sibling.try_reseed_fpu(expected_fpu, root_value_for_leaf);
                        }
                    }
                }
                running_weight = 0;
            }
        }
        value = flip_value(value);
    }

    ctx.stats.node_count.fetch_add(1, Ordering::Relaxed);
    MctsOutcome::Completed
}

/// Pull an unproven evaluation toward the draw in drained positions as the
/// no-progress counter climbs.
#[inline]
pub fn decay_toward_draw(value: f32, endgame_proportion: f32, rule50: u32, divisor: f32) -> f32 {
    value + (VALUE_DRAW - value) * endgame_proportion * rule50 as f32 / divisor
}

/// A leaf proved mate-in-1; walk proofs up the path while they hold.
fn backpropagate_mate(path: &[PathEntry]) {
    let mut position = path.len() - 1;
    let mut opponent_turn = true;

    while position >= 1 {
        let parent = path[position - 1].node.get();
        let child = path[position].node.get();

        if opponent_turn {
            // The mover below has a forced mate, so the mover into the parent
            // is getting mated. Keep the shortest distance.
            let TerminalValue::MateIn(distance) = child.terminal() else {
                break;
            };
            let improved = match parent.terminal() {
                TerminalValue::NonTerminal => true,
                TerminalValue::OpponentMateIn(existing) => distance < existing,
                _ => false,
            };
            if !improved {
                break;
            }
            parent.set_terminal(TerminalValue::OpponentMateIn(distance));
        } else {
            // Every reply must lose for the parent to be a forced win.
            let Some(children) = parent.children() else {
                break;
            };
            let mut longest = 0u8;
            let mut all_lost = true;
            for sibling in children {
                match sibling.terminal() {
                    TerminalValue::OpponentMateIn(k) => longest = longest.max(k),
                    _ => {
                        all_lost = false;
                        break;
                    }
                }
            }
            if !all_lost {
                break;
            }
            let distance = longest.saturating_add(1).min(MAX_MATE_PLIES);
            let improved = match parent.terminal() {
                TerminalValue::NonTerminal => true,
                TerminalValue::MateIn(existing) => distance < existing,
                _ => false,
            };
            if !improved {
                break;
            }
            parent.set_terminal(TerminalValue::MateIn(distance));
        }

        // The parent's terminal changed; its standing at the grandparent may
        // have improved, so fix the best index locally.
        if position >= 2 {
            let grandparent = path[position - 2].node.get();
            let parent_index = path[position - 1].child_index as usize;
            if let Some(children) = grandparent.children() {
                match grandparent.best_index() {
                    None => grandparent.set_best_index(parent_index),
                    Some(best) if best != parent_index => {
                        if children[best].worse_than(&children[parent_index]) {
                            grandparent.set_best_index(parent_index);
                        }
                    }
                    _ => {}
                }
            }
        }

        opponent_turn = !opponent_turn;
        position -= 1;
    }
}

/// Walk root-to-leaf repairing `best_index` where the freshly updated path
/// node now beats the recorded best. The walk follows the path while it
/// coincides with (or takes over) the best chain and stops where it diverges
/// under a still-better sibling; subtrees off the best chain are repaired
/// lazily when they are visited again.
fn update_best_child_chain(ctx: &SearchContext, path: &[PathEntry]) {
    for level in 0..path.len().saturating_sub(1) {
        let parent = path[level].node.get();
        let next_index = path[level + 1].child_index as usize;
        let Some(children) = parent.children() else {
            break;
        };
        match parent.best_index() {
            None => {
                parent.set_best_index(next_index);
                if level == 0 {
                    ctx.stats.mark_pv_changed();
                }
            }
            Some(best) if best == next_index => {}
            Some(best) => {
                if children[best].worse_than(&children[next_index]) {
                    parent.set_best_index(next_index);
                    if level == 0 {
                        ctx.stats.mark_pv_changed();
                    }
                } else {
                    break;
                }
            }
        }
    }
}

fn fail_path(ctx: &SearchContext, slot: &mut SearchSlot) -> MctsOutcome {
    for entry in slot.path.iter().rev() {
        entry.node.get().abandon_visit();
    }
    slot.path.clear();
    ctx.stats.failed_node_count.fetch_add(1, Ordering::Relaxed);
    MctsOutcome::NotReady
}

/// Rank root children from a tablebase root probe. Ranks dominate visit
/// counts in best-child ordering, so a ranked root converges onto
/// tablebase-optimal moves immediately.
pub fn apply_root_tablebase_ranks(root: &Node, tablebase: &Tablebase, game: &Game) {
    let Some(children) = root.children() else {
        return;
    };
    let Some(ranked) = tablebase.probe_root(game.board()) else {
        return;
    };
    for child in children {
        let mv = decode_move(child.encoded_move());
        if let Some(entry) = ranked.iter().find(|r| r.mv == mv) {
            child.set_rank_bound(entry.rank, child.bound());
        }
    }
}

/// Mix Dirichlet noise into the root priors at the start of a self-play
/// move so the policy target explores.
pub fn add_exploration_noise(root: &Node, options: &EngineOptions, rng: &mut SmallRng) {
    let Some(children) = root.children() else {
        return;
    };
    if options.root_exploration_fraction <= 0.0 || children.is_empty() {
        return;
    }
    let gamma = match Gamma::new(options.root_dirichlet_alpha as f64, 1.0) {
        Ok(gamma) => gamma,
        Err(_) => return,
    };
    let mut noise: Vec<f32> = (0..children.len())
        .map(|_| gamma.sample(rng) as f32)
        .collect();
    let total: f32 = noise.iter().sum();
    if total > 0.0 {
        for n in &mut noise {
            *n /= total;
        }
    }
    let fraction = options.root_exploration_fraction;
    for (child, n) in children.iter().zip(noise) {
        let mixed = child.prior() * (1.0 - fraction) + n * fraction;
        child.set_quantized_prior(quantize_probability(mixed));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    Search,
    SelfPlay,
}

/// Choose the move to actually play once the search budget is spent.
pub fn select_move(
    root: &Node,
    game: &Game,
    options: &EngineOptions,
    mode: PlayMode,
    rng: &mut SmallRng,
) -> Option<(usize, ChessMove)> {
    let children = root.children()?;
    if children.is_empty() {
        return None;
    }

    let best_index = match root.best_index() {
        Some(index) => index,
        None => {
            // Nothing searched: fall back to the highest prior.
            let index = argmax_by(children, |c| c.prior())?;
            return Some((index, decode_move(children[index].encoded_move())));
        }
    };

    if mode == PlayMode::SelfPlay && game.ply() < options.num_sampling_moves {
        if let Some(index) = sample_by_visits(children, rng) {
            return Some((index, decode_move(children[index].encoded_move())));
        }
        // All weights zero: fall through to the best-visited child.
    }

    if mode == PlayMode::Search && game.ply() < options.move_diversity_plies {
        if let Some(index) = sample_diverse(children, best_index, options, rng) {
            return Some((index, decode_move(children[index].encoded_move())));
        }
    }

    if mode == PlayMode::Search && game.material() < options.endgame_material_max {
        if let Some(index) = minimax_rollback(root, children) {
            return Some((index, decode_move(children[index].encoded_move())));
        }
    }

    Some((best_index, decode_move(children[best_index].encoded_move())))
}

fn argmax_by(children: &[Node], key: impl Fn(&Node) -> f32) -> Option<usize> {
    children
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            key(a)
                .partial_cmp(&key(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(index, _)| index)
}

/// Temperature-1 sampling over visit counts, for early self-play plies.
fn sample_by_visits(children: &[Node], rng: &mut SmallRng) -> Option<usize> {
    let total: u64 = children.iter().map(|c| c.visit_count() as u64).sum();
    if total == 0 {
        return None;
    }
    let mut sample = rng.gen_range(0..total);
    for (index, child) in children.iter().enumerate() {
        let visits = child.visit_count() as u64;
        if sample < visits {
            return Some(index);
        }
        sample -= visits;
    }
    None
}

/// Early-game diversity in search mode: sample among the children that match
/// the best child's tablebase rank and mate category and sit within a value
/// delta, weighted by tempered visit share.
fn sample_diverse(
    children: &[Node],
    best_index: usize,
    options: &EngineOptions,
    rng: &mut SmallRng,
) -> Option<usize> {
    let best = &children[best_index];
    let best_value = best.value();
    let best_rank = best.tablebase_rank();
    let best_category = terminal_category(best);
    let max_visits = children.iter().map(|c| c.visit_count()).max()?.max(1);

    let mut candidates: Vec<(usize, f32)> = Vec::new();
    for (index, child) in children.iter().enumerate() {
        if child.tablebase_rank() != best_rank || terminal_category(child) != best_category {
            continue;
        }
        if child.value() < best_value - options.move_diversity_delta {
            continue;
        }
        let share = child.visit_count() as f32 / max_visits as f32;
        let weight = share.powf(1.0 / options.move_diversity_temperature);
        if weight > 0.0 {
            candidates.push((index, weight));
        }
    }
    if candidates.len() <= 1 {
        return candidates.first().map(|&(index, _)| index);
    }

    let total: f32 = candidates.iter().map(|(_, w)| w).sum();
    let mut sample = rng.gen_range(0.0..total);
    for &(index, weight) in &candidates {
        if sample < weight {
            return Some(index);
        }
        sample -= weight;
    }
    candidates.last().map(|&(index, _)| index)
}

fn terminal_category(node: &Node) -> i8 {
    match node.terminal() {
        TerminalValue::MateIn(_) => 1,
        TerminalValue::OpponentMateIn(_) => -1,
        _ => 0,
    }
}

/// Post-hoc minimax over the visited tree for low-material endgames, where
/// averaged values blur wins into draws.
fn minimax_rollback(root: &Node, children: &[Node]) -> Option<usize> {
    let root_visits = root.virtual_visit_count();
    let mut best: Option<(usize, f32)> = None;
    for (index, child) in children.iter().enumerate() {
        if let Some(value) = minimax_value(child, root_visits) {
            if best.map_or(true, |(_, b)| value > b) {
                best = Some((index, value));
            }
        }
    }
    best.map(|(index, _)| index)
}

fn minimax_value(node: &Node, parent_visits: u32) -> Option<f32> {
    let visits = node.visit_count();
    if (visits as u64) * MINIMAX_VISIT_RATIO < parent_visits as u64 {
        return None;
    }
    if visits >= MINIMAX_RECURSE_VISITS {
        if let Some(children) = node.children() {
            let mut best: Option<f32> = None;
            for child in children {
                if let Some(value) = minimax_value(child, visits) {
                    best = Some(best.map_or(value, |b: f32| b.max(value)));
                }
            }
            if let Some(best) = best {
                return Some(flip_value(best));
            }
        }
    }
    Some(node.value())
}

/// Follow the best-child chain out of the root for printing.
pub fn principal_variation(root: &Node, max_length: usize) -> Vec<ChessMove> {
    let mut line = Vec::new();
    let mut node = root;
    while line.len() < max_length {
        let Some(children) = node.children() else {
            break;
        };
        let Some(index) = node.best_index() else {
            break;
        };
        let Some(child) = children.get(index) else {
            break;
        };
        line.push(decode_move(child.encoded_move()));
        node = child;
    }
    line
}
