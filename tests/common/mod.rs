use kestrel::cache::PredictionCache;
use kestrel::config::EngineOptions;
use kestrel::game::Game;
use kestrel::mcts::{SearchContext, SearchStats};
use kestrel::network::{NetworkKind, UniformNetwork};
use kestrel::node::Node;
use kestrel::worker::BatchWorker;

pub struct Harness {
    pub options: EngineOptions,
    pub cache: PredictionCache,
    pub stats: SearchStats,
    pub network: UniformNetwork,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            options: EngineOptions::default(),
            cache: PredictionCache::with_geometry(2, 64),
            stats: SearchStats::new(),
            network: UniformNetwork,
        }
    }

    pub fn context(&self) -> SearchContext<'_> {
        SearchContext {
            options: &self.options,
            cache: &self.cache,
            tablebase: None,
            stats: &self.stats,
            searching: true,
            search_moves: &[],
        }
    }

    /// Drive a fresh single-threaded worker until at least `simulations`
    /// iterations complete against `root`.
    pub fn search(&self, root: &Node, game: &Game, slots: usize, simulations: u64) -> u64 {
        let ctx = self.context();
        let mut worker = BatchWorker::new(slots);
        let mut completed = 0u64;
        let mut idle_rounds = 0;
        while completed < simulations && idle_rounds < 10_000 {
            let report = worker
                .tick(&ctx, root, game, &self.network, NetworkKind::Full, slots)
                .expect("prediction pipeline");
            completed += report.completed;
            idle_rounds += 1;
        }
        worker.interrupt_all();
        completed
    }
}

pub fn fresh_root() -> Node {
    Node::new(0, 0, 0.0)
}
