use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI16, AtomicI8, AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::encoder::dequantize_probability;
use crate::game::{VALUE_DRAW, VALUE_LOSS, VALUE_WIN};

pub const NO_BEST: u8 = u8::MAX;

/// Longest representable forced-mate distance.
pub const MAX_MATE_PLIES: u8 = 125;

const TERMINAL_DRAW: i8 = i8::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Expansion {
    None = 0,
    Expanding = 1,
    Expanded = 2,
}

impl Expansion {
    #[inline]
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Expansion::Expanding,
            2 => Expansion::Expanded,
            _ => Expansion::None,
        }
    }
}

/// Terminal knowledge about a node, always from the parent's perspective:
/// `MateIn(k)` means the player who moved into this node forces mate in k.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalValue {
    NonTerminal,
    MateIn(u8),
    OpponentMateIn(u8),
    Draw,
}

impl TerminalValue {
    #[inline]
    fn from_bits(bits: i8) -> Self {
        match bits {
            0 => TerminalValue::NonTerminal,
            TERMINAL_DRAW => TerminalValue::Draw,
            k if k > 0 => TerminalValue::MateIn(k as u8),
            k => TerminalValue::OpponentMateIn((-(k as i16)) as u8),
        }
    }

    #[inline]
    fn to_bits(self) -> i8 {
        match self {
            TerminalValue::NonTerminal => 0,
            TerminalValue::Draw => TERMINAL_DRAW,
            TerminalValue::MateIn(k) => k.min(MAX_MATE_PLIES) as i8,
            TerminalValue::OpponentMateIn(k) => -(k.min(MAX_MATE_PLIES) as i8),
        }
    }

    /// Immediate game-over values that need no search below them.
    #[inline]
    pub fn is_immediate(self) -> bool {
        matches!(self, TerminalValue::Draw | TerminalValue::MateIn(1))
    }

    #[inline]
    pub fn value(self) -> Option<f32> {
        match self {
            TerminalValue::NonTerminal => None,
            TerminalValue::MateIn(_) => Some(VALUE_WIN),
            TerminalValue::OpponentMateIn(_) => Some(VALUE_LOSS),
            TerminalValue::Draw => Some(VALUE_DRAW),
        }
    }

    /// Ordering key for best-child comparison: category first (forced win,
    /// neutral, forced loss), then distance (short mates and long losses
    /// first within their category).
    #[inline]
    fn order_key(self) -> (i8, i16) {
        match self {
            TerminalValue::MateIn(k) => (2, -(k as i16)),
            TerminalValue::NonTerminal | TerminalValue::Draw => (1, 0),
            TerminalValue::OpponentMateIn(k) => (0, k as i16),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bound {
    None = 0,
    Upper = 1,
    Lower = 2,
    Exact = 3,
}

impl Bound {
    #[inline]
    fn from_bits(bits: i16) -> Self {
        match bits & 0x3 {
            1 => Bound::Upper,
            2 => Bound::Lower,
            3 => Bound::Exact,
            _ => Bound::None,
        }
    }

    /// The proven score a bound pins the node to, from the parent's
    /// perspective. Bounds come from tablebase probes, so each kind carries
    /// its score implicitly.
    #[inline]
    pub fn score(self) -> Option<f32> {
        match self {
            Bound::None => None,
            Bound::Upper => Some(VALUE_LOSS),
            Bound::Exact => Some(VALUE_DRAW),
            Bound::Lower => Some(VALUE_WIN),
        }
    }
}

/// One search-tree node. All cross-thread fields are single-word atomics
/// accessed relaxed; `children` is published by the expansion owner with a
/// release store of `Expansion::Expanded` and read under an acquire load.
///
/// Values are win probabilities in [0, 1] from the parent's perspective.
/// While `value_weight == 0`, `value_average` holds the first-play-urgency
/// seed, not a sample.
pub struct Node {
    mv: u16,
    quantized_prior: AtomicU16,
    visit_count: AtomicU32,
    visiting_count: AtomicU32,
    value_average: AtomicU32,
    value_weight: AtomicU32,
    terminal: AtomicI8,
    rank_bound: AtomicI16,
    expansion: AtomicU8,
    best_index: AtomicU8,
    children: UnsafeCell<Option<Box<[Node]>>>,
}

unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub fn new(mv: u16, quantized_prior: u16, fpu: f32) -> Self {
        Self {
            mv,
            quantized_prior: AtomicU16::new(quantized_prior),
            visit_count: AtomicU32::new(0),
            visiting_count: AtomicU32::new(0),
            value_average: AtomicU32::new(fpu.to_bits()),
            value_weight: AtomicU32::new(0),
            terminal: AtomicI8::new(0),
            rank_bound: AtomicI16::new(0),
            expansion: AtomicU8::new(Expansion::None as u8),
            best_index: AtomicU8::new(NO_BEST),
            children: UnsafeCell::new(None),
        }
    }

    /// Placeholder left behind when a child is promoted out of its array.
    fn stub() -> Self {
        Self::new(0, 0, VALUE_DRAW)
    }

    #[inline]
    pub fn encoded_move(&self) -> u16 {
        self.mv
    }

    #[inline]
    pub fn prior(&self) -> f32 {
        dequantize_probability(self.quantized_prior.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn quantized_prior(&self) -> u16 {
        self.quantized_prior.load(Ordering::Relaxed)
    }

    /// Root exploration noise rewrites the prior in place; nothing else may.
    #[inline]
    pub fn set_quantized_prior(&self, q: u16) {
        self.quantized_prior.store(q, Ordering::Relaxed);
    }

    #[inline]
    pub fn visit_count(&self) -> u32 {
        self.visit_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn visiting_count(&self) -> u32 {
        self.visiting_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn begin_visit(&self) {
        self.visiting_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn abandon_visit(&self) {
        self.visiting_count.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn complete_visit(&self) {
        self.visiting_count.fetch_sub(1, Ordering::Relaxed);
        self.visit_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> f32 {
        f32::from_bits(self.value_average.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn value_weight(&self) -> u32 {
        self.value_weight.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_value(&self, value: f32) {
        self.value_average.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Fold one weighted sample into the running average. The divisor grows
    /// with the sample count, scaled down by `build` early on and capped so
    /// old searches stay adaptive.
    pub fn sample_value(&self, value: f32, build: f32, cap: u32) -> u32 {
        let weight = self.value_weight.fetch_add(1, Ordering::Relaxed) + 1;
        let divisor = (weight as f32 / build).max(1.0).min(cap as f32);
        let mut current = self.value_average.load(Ordering::Relaxed);
        loop {
            let old = f32::from_bits(current);
            // The first sample replaces the urgency seed outright.
            let new = if weight == 1 { value } else { old + (value - old) / divisor };
            match self.value_average.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return weight,
                Err(seen) => current = seen,
            }
        }
    }

    /// Replace an untouched urgency seed with a better estimate. Used by the
    /// draw-sibling rule; loses quietly to any concurrent sample.
    pub fn try_reseed_fpu(&self, expected_fpu: f32, value: f32) {
        if self.value_weight.load(Ordering::Relaxed) != 0 {
            return;
        }
        let _ = self.value_average.compare_exchange(
            expected_fpu.to_bits(),
            value.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    #[inline]
    pub fn terminal(&self) -> TerminalValue {
        TerminalValue::from_bits(self.terminal.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_terminal(&self, value: TerminalValue) {
        self.terminal.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn bound(&self) -> Bound {
        Bound::from_bits(self.rank_bound.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn tablebase_rank(&self) -> i16 {
        self.rank_bound.load(Ordering::Relaxed) >> 2
    }

    #[inline]
    pub fn set_rank_bound(&self, rank: i16, bound: Bound) {
        let packed = (rank.clamp(-4000, 4000) << 2) | bound as i16;
        self.rank_bound.store(packed, Ordering::Relaxed);
    }

    /// Clamp a backpropagating value so it never crosses proven knowledge.
    pub fn bounded_value(&self, value: f32) -> f32 {
        if let Some(v) = self.terminal().value() {
            return v;
        }
        match self.bound() {
            Bound::None => value,
            Bound::Upper => value.min(VALUE_LOSS),
            Bound::Exact => VALUE_DRAW,
            Bound::Lower => value.max(VALUE_WIN),
        }
    }

    /// The value the selector sees: the proven bound score when one exists,
    /// otherwise the running average diluted by in-flight visits so parallel
    /// workers spread out. With enough virtual loss this tends to zero.
    pub fn value_with_virtual_loss(&self, virtual_loss_coefficient: f32) -> f32 {
        if let Some(score) = self.bound().score() {
            return score;
        }
        let safe_weight = self.value_weight().max(1) as f32;
        let virtual_losses = self.visiting_count() as f32 * virtual_loss_coefficient;
        self.value() * safe_weight / (safe_weight + virtual_losses)
    }

    #[inline]
    pub fn expansion(&self) -> Expansion {
        Expansion::from_bits(self.expansion.load(Ordering::Acquire))
    }

    /// Claim the right to expand. Exactly one thread wins.
    pub fn try_begin_expansion(&self) -> bool {
        self.expansion
            .compare_exchange(
                Expansion::None as u8,
                Expansion::Expanding as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Publish the child array. Only the thread that won `try_begin_expansion`
    /// may call this, once.
    pub fn publish_children(&self, children: Box<[Node]>) {
        debug_assert_eq!(
            self.expansion.load(Ordering::Relaxed),
            Expansion::Expanding as u8
        );
        unsafe { *self.children.get() = Some(children) };
        self.expansion.store(Expansion::Expanded as u8, Ordering::Release);
    }

    /// Back out of an expansion claim (terminal leaf or interrupted search).
    pub fn cancel_expansion(&self) {
        self.expansion.store(Expansion::None as u8, Ordering::Release);
    }

    /// Children, visible only after the expansion owner's release store.
    pub fn children(&self) -> Option<&[Node]> {
        if self.expansion() != Expansion::Expanded {
            return None;
        }
        unsafe { (*self.children.get()).as_deref() }
    }

    pub fn child_count(&self) -> usize {
        self.children().map_or(0, |c| c.len())
    }

    #[inline]
    pub fn best_index(&self) -> Option<usize> {
        match self.best_index.load(Ordering::Relaxed) {
            NO_BEST => None,
            index => Some(index as usize),
        }
    }

    #[inline]
    pub fn set_best_index(&self, index: usize) {
        debug_assert!(index < NO_BEST as usize);
        self.best_index.store(index as u8, Ordering::Relaxed);
    }

    pub fn best_child(&self) -> Option<&Node> {
        let children = self.children()?;
        children.get(self.best_index()?)
    }

    /// Strictly-worse ordering for best-child maintenance: tablebase rank,
    /// then terminal category and distance, then visit count.
    pub fn worse_than(&self, other: &Node) -> bool {
        let (my_rank, other_rank) = (self.tablebase_rank(), other.tablebase_rank());
        if my_rank != other_rank {
            return my_rank < other_rank;
        }
        let (my_key, other_key) = (self.terminal().order_key(), other.terminal().order_key());
        if my_key != other_key {
            return my_key < other_key;
        }
        self.visit_count() < other.visit_count()
    }

    /// Build a child array for `finish_expanding`. Each move carries its
    /// quantized prior; every child's average starts at the urgency seed.
    pub fn build_children(moves: &[(u16, u16)], fpu: f32) -> Box<[Node]> {
        moves
            .iter()
            .map(|&(mv, prior)| Node::new(mv, prior, fpu))
            .collect()
    }

    /// Promote one child to a standalone root, dropping this node and every
    /// other subtree. Single-threaded use only, between searches.
    pub fn detach_child(mut self: Box<Self>, index: usize) -> Box<Node> {
        let children = self
            .children
            .get_mut()
            .take()
            .expect("detach_child on an unexpanded node");
        let mut children = children.into_vec();
        let kept = std::mem::replace(&mut children[index], Node::stub());
        Box::new(kept)
    }

    /// Visits plus in-flight visits, the denominator PUCT works in.
    #[inline]
    pub fn virtual_visit_count(&self) -> u32 {
        self.visit_count() + self.visiting_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_packing_round_trips() {
        for t in [
            TerminalValue::NonTerminal,
            TerminalValue::Draw,
            TerminalValue::MateIn(1),
            TerminalValue::MateIn(99),
            TerminalValue::OpponentMateIn(3),
        ] {
            assert_eq!(TerminalValue::from_bits(t.to_bits()), t);
        }
    }

    #[test]
    fn rank_bound_packing() {
        let node = Node::new(0, 100, 0.0);
        node.set_rank_bound(-900, Bound::Lower);
        assert_eq!(node.tablebase_rank(), -900);
        assert_eq!(node.bound(), Bound::Lower);
    }

    #[test]
    fn expansion_claim_is_exclusive() {
        let node = Node::new(0, 100, 0.0);
        assert!(node.try_begin_expansion());
        assert!(!node.try_begin_expansion());
        node.publish_children(Node::build_children(&[(1, 100), (2, 200)], 0.3));
        assert_eq!(node.expansion(), Expansion::Expanded);
        assert_eq!(node.child_count(), 2);
    }

    #[test]
    fn children_invisible_before_publish() {
        let node = Node::new(0, 100, 0.0);
        assert!(node.children().is_none());
        assert!(node.try_begin_expansion());
        assert!(node.children().is_none());
    }

    #[test]
    fn first_sample_replaces_fpu_seed() {
        let node = Node::new(0, 100, 0.3);
        assert_eq!(node.value(), 0.3);
        assert_eq!(node.value_weight(), 0);
        node.sample_value(0.9, 2.0, 500);
        assert_eq!(node.value(), 0.9);
        assert_eq!(node.value_weight(), 1);
    }

    #[test]
    fn moving_average_tracks_samples() {
        let node = Node::new(0, 100, 0.0);
        for _ in 0..100 {
            node.sample_value(1.0, 2.0, 500);
        }
        assert!(node.value() > 0.9, "average should approach 1.0");
        node.sample_value(0.0, 2.0, 500);
        assert!(node.value() < 1.0);
    }

    #[test]
    fn reseed_only_replaces_untouched_seed() {
        let node = Node::new(0, 100, 0.3);
        node.try_reseed_fpu(0.3, 0.8);
        assert_eq!(node.value(), 0.8);

        let sampled = Node::new(0, 100, 0.3);
        sampled.sample_value(0.5, 2.0, 500);
        sampled.try_reseed_fpu(0.3, 0.8);
        assert_eq!(sampled.value(), 0.5);
    }

    #[test]
    fn bounded_value_respects_proofs() {
        let node = Node::new(0, 100, 0.0);
        assert_eq!(node.bounded_value(0.7), 0.7);
        node.set_rank_bound(0, Bound::Exact);
        assert_eq!(node.bounded_value(0.7), 0.5);
        node.set_terminal(TerminalValue::MateIn(2));
        assert_eq!(node.bounded_value(0.1), 1.0);
    }

    #[test]
    fn virtual_loss_dilutes_toward_zero() {
        let node = Node::new(0, 100, 0.0);
        node.sample_value(1.0, 2.0, 500);
        let undiluted = node.value_with_virtual_loss(1.0);
        for _ in 0..1000 {
            node.begin_visit();
        }
        let diluted = node.value_with_virtual_loss(1.0);
        assert!(diluted < undiluted);
        assert!(diluted < 0.01);
    }

    #[test]
    fn detach_child_keeps_subtree() {
        let root = Box::new(Node::new(0, 100, 0.0));
        assert!(root.try_begin_expansion());
        root.publish_children(Node::build_children(&[(10, 50), (20, 60)], 0.3));
        let children = root.children().unwrap();
        children[1].sample_value(0.9, 2.0, 500);

        let promoted = root.detach_child(1);
        assert_eq!(promoted.encoded_move(), 20);
        assert_eq!(promoted.value_weight(), 1);
    }

    #[test]
    fn worse_than_ordering() {
        let a = Node::new(0, 100, 0.0);
        let b = Node::new(1, 100, 0.0);

        // Visits break ties.
        b.complete_visit_for_test();
        assert!(a.worse_than(&b));
        assert!(!b.worse_than(&a));

        // Terminal category dominates visits.
        a.set_terminal(TerminalValue::MateIn(3));
        assert!(!a.worse_than(&b));
        assert!(b.worse_than(&a));

        // Shorter mate wins within the category.
        b.set_terminal(TerminalValue::MateIn(2));
        assert!(a.worse_than(&b));

        // Tablebase rank dominates everything.
        a.set_rank_bound(5, Bound::Lower);
        assert!(!a.worse_than(&b));
        assert!(b.worse_than(&a));
    }

    impl Node {
        fn complete_visit_for_test(&self) {
            self.begin_visit();
            self.complete_visit();
        }
    }
}
