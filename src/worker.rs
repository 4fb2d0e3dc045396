use anyhow::Result;

use crate::encoder::{InputPlanes, INPUT_SIZE, POLICY_SIZE};
use crate::game::Game;
use crate::mcts::{run_mcts, MctsOutcome, SearchContext, SearchSlot, SlotState};
use crate::network::{Network, NetworkKind, PredictStatus};
use crate::node::Node;

/// What one worker tick did: simulations completed on the CPU side, requests
/// submitted to the network, and the status bits the network reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub completed: u64,
    pub failed: u64,
    pub predicted: usize,
    pub status: PredictStatus,
}

/// One worker thread's slots and its reusable batch buffers. Every slot
/// descends the shared tree independently; the batch call is the only
/// synchronization with the device.
pub struct BatchWorker {
    slots: Vec<SearchSlot>,
    pending: Vec<usize>,
    images: Vec<InputPlanes>,
    values: Vec<f32>,
    policies: Vec<f32>,
}

impl BatchWorker {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| SearchSlot::new()).collect(),
            pending: Vec::with_capacity(slot_count),
            images: vec![[0f32; INPUT_SIZE]; slot_count],
            values: vec![0f32; slot_count],
            policies: vec![0f32; slot_count * POLICY_SIZE],
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// One scheduling round:
    /// 1. resume every slot that was waiting on the previous batch,
    /// 2. run fresh iterations on up to `parallelism` slots,
    /// 3. submit one fixed-shape batch for whatever asked for evaluation.
    ///
    /// The batch is always padded to the full slot count so the device sees
    /// one shape per call site.
    pub fn tick(
        &mut self,
        ctx: &SearchContext,
        root: &Node,
        root_game: &Game,
        network: &dyn Network,
        kind: NetworkKind,
        parallelism: usize,
    ) -> Result<TickReport> {
        let mut report = TickReport::default();

        // Absorb the previous batch's results.
        for (batch_position, &slot_index) in self.pending.iter().enumerate() {
            let value = self.values[batch_position];
            let policy =
                &self.policies[batch_position * POLICY_SIZE..(batch_position + 1) * POLICY_SIZE];
            let slot = &mut self.slots[slot_index];
            match run_mcts(ctx, root, root_game, slot, Some((value, policy))) {
                MctsOutcome::Completed => report.completed += 1,
                MctsOutcome::NotReady => report.failed += 1,
                MctsOutcome::WaitingForPrediction => unreachable!("resume never re-requests"),
            }
        }
        self.pending.clear();

        // Fresh iterations, possibly throttled during slowstart.
        let active = parallelism.clamp(1, self.slots.len());
        for slot_index in 0..active {
            let slot = &mut self.slots[slot_index];
            if slot.state != SlotState::Working {
                continue;
            }
            match run_mcts(ctx, root, root_game, slot, None) {
                MctsOutcome::Completed => report.completed += 1,
                MctsOutcome::NotReady => report.failed += 1,
                MctsOutcome::WaitingForPrediction => {
                    let batch_position = self.pending.len();
                    self.images[batch_position] = slot.image;
                    self.pending.push(slot_index);
                }
            }
        }

        if !self.pending.is_empty() {
            // Pad to the fixed shape; stale tail images are fine.
            for image in self.images[self.pending.len()..].iter_mut() {
                image.fill(0.0);
            }
            report.status =
                network.predict_batch(kind, &self.images, &mut self.values, &mut self.policies)?;
            report.predicted = self.pending.len();
        }

        Ok(report)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Finalization: unwind every in-flight iteration so visiting counts
    /// return to zero and claimed expansions are released.
    pub fn interrupt_all(&mut self) {
        self.pending.clear();
        for slot in &mut self.slots {
            slot.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PredictionCache;
    use crate::config::EngineOptions;
    use crate::mcts::SearchStats;
    use crate::network::UniformNetwork;

    fn context<'a>(
        options: &'a EngineOptions,
        cache: &'a PredictionCache,
        stats: &'a SearchStats,
    ) -> SearchContext<'a> {
        SearchContext {
            options,
            cache,
            tablebase: None,
            stats,
            searching: true,
            search_moves: &[],
        }
    }

    #[test]
    fn ticks_expand_the_tree_and_settle() {
        let options = EngineOptions::default();
        let cache = PredictionCache::with_geometry(1, 64);
        let stats = SearchStats::new();
        let ctx = context(&options, &cache, &stats);
        let network = UniformNetwork;

        let root = Node::new(0, 0, 0.0);
        let game = Game::startpos();
        let mut worker = BatchWorker::new(4);

        let mut completed = 0u64;
        for _ in 0..200 {
            let report = worker
                .tick(&ctx, &root, &game, &network, NetworkKind::Full, 4)
                .unwrap();
            completed += report.completed;
            if completed >= 100 {
                break;
            }
        }
        assert!(completed >= 100, "only {completed} simulations completed");
        assert!(root.visit_count() >= 100);

        worker.interrupt_all();
        assert_eq!(root.visiting_count(), 0, "in-flight counts must unwind");
    }
}
