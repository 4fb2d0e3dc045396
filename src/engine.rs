use anyhow::{anyhow, Result};
use chess::ChessMove;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::PredictionCache;
use crate::config::EngineOptions;
use crate::game::{encode_move, flip_value, Game};
use crate::mcts::{
    apply_root_tablebase_ranks, principal_variation, seeded_rng, select_move, PlayMode,
    SearchContext, SearchStats,
};
use crate::coordinator::WorkCoordinator;
use crate::network::{Network, NetworkKind, PredictStatus};
use crate::node::{Node, TerminalValue};
use crate::tablebase::Tablebase;
use crate::time_control::{should_stop, TimeControl};
use crate::worker::BatchWorker;

/// Seconds between cache flushes triggered by network updates, shared across
/// every worker thread.
const CACHE_FLUSH_INTERVAL_SECS: u64 = 300;

/// Milliseconds between routine PV reprints when nothing changed.
const PV_PRINT_INTERVAL_MS: u64 = 1_000;

/// The tree that survives between searches so a position update can continue
/// where the previous search left off.
struct SearchTree {
    root: Box<Node>,
    game: Game,
}

/// Everything a search session shares across its worker threads.
struct SearchShared {
    tree: SearchTree,
    options: EngineOptions,
    stats: SearchStats,
    coordinator: Arc<WorkCoordinator>,
    cache: Arc<PredictionCache>,
    network: Arc<dyn Network>,
    tablebase: Option<Arc<Tablebase>>,
    time_control: TimeControl,
    search_moves: Vec<ChessMove>,
    start: Instant,
    last_cache_flush: Arc<AtomicU64>,
}

struct SearchSession {
    shared: Arc<SearchShared>,
    coordinator: Arc<WorkCoordinator>,
    handle: JoinHandle<()>,
}

/// Lifecycle: Idle -> Searching -> Finalizing -> Idle. `go` moves the tree
/// into a shared session and spawns the workers; `wait` joins them, repairs
/// in-flight state, and takes the tree back.
pub struct Engine {
    options: EngineOptions,
    cache: Arc<PredictionCache>,
    network: Arc<dyn Network>,
    tablebase: Option<Arc<Tablebase>>,
    tree: Option<SearchTree>,
    session: Option<SearchSession>,
    position_fen: Option<String>,
    position_moves: Vec<String>,
    last_cache_flush: Arc<AtomicU64>,
    warmed_up: bool,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        network: Arc<dyn Network>,
        tablebase: Option<Arc<Tablebase>>,
    ) -> Result<Self> {
        options.validate()?;
        let mut cache = PredictionCache::new();
        cache.allocate(options.cache_gib, options.cache_min_gib)?;
        Ok(Self::with_cache(options, network, tablebase, cache))
    }

    /// Injection point for tests and benches that want a small cache.
    pub fn with_cache(
        options: EngineOptions,
        network: Arc<dyn Network>,
        tablebase: Option<Arc<Tablebase>>,
        cache: PredictionCache,
    ) -> Self {
        Self {
            options,
            cache: Arc::new(cache),
            network,
            tablebase,
            tree: None,
            session: None,
            position_fen: None,
            position_moves: Vec::new(),
            last_cache_flush: Arc::new(AtomicU64::new(0)),
            warmed_up: false,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EngineOptions {
        &mut self.options
    }

    pub fn new_game(&mut self) {
        self.wait();
        self.tree = None;
        self.position_fen = None;
        self.position_moves.clear();
        self.cache.clear();
    }

    /// Install a position. When the new position extends the committed one by
    /// a move suffix, the matching subtree is promoted move by move and the
    /// rest of each child array is freed; otherwise the whole tree is pruned.
    pub fn set_position(&mut self, fen: Option<&str>, moves: &[String]) -> Result<()> {
        self.wait();

        let reusable = self.tree.is_some()
            && self.position_fen.as_deref() == fen
            && moves.len() >= self.position_moves.len()
            && moves[..self.position_moves.len()] == self.position_moves[..];

        if reusable {
            let mut tree = self.tree.take().unwrap();
            let mut reused = true;
            for text in &moves[self.position_moves.len()..] {
                let mv = tree.game.parse_uci_move(text)?;
                let encoded = encode_move(mv);
                let child_index = tree.root.children().and_then(|children| {
                    children
                        .iter()
                        .position(|child| child.encoded_move() == encoded)
                });
                match child_index {
                    Some(index) => {
                        tree.game.apply_move(mv);
                        tree.root = tree.root.detach_child(index);
                    }
                    None => {
                        reused = false;
                        break;
                    }
                }
            }
            if reused {
                self.tree = Some(tree);
                self.position_fen = fen.map(str::to_owned);
                self.position_moves = moves.to_vec();
                return Ok(());
            }
        }

        // Fresh tree for the target position.
        let mut game = match fen {
            Some(fen) => Game::from_fen(fen)?,
            None => Game::startpos(),
        };
        for text in moves {
            let mv = game.parse_uci_move(text)?;
            game.apply_move(mv);
        }
        self.tree = Some(SearchTree {
            root: Box::new(Node::new(0, 0, 0.0)),
            game,
        });
        self.position_fen = fen.map(str::to_owned);
        self.position_moves = moves.to_vec();
        Ok(())
    }

    pub fn is_searching(&self) -> bool {
        self.session.is_some()
    }

    /// Start a search. Returns immediately; the session prints `info` lines
    /// and the final `bestmove` from its own threads.
    pub fn go(&mut self, time_control: TimeControl, search_moves: Vec<ChessMove>) -> Result<()> {
        self.wait();
        if self.tree.is_none() {
            self.set_position(None, &[])?;
        }
        let tree = self.tree.take().unwrap();

        if !self.warmed_up {
            let sizes = [
                self.options.slowstart_parallelism,
                self.options.prediction_batch_size,
            ];
            crate::network::warm_up_predictions(self.network.as_ref(), &sizes)?;
            self.warmed_up = true;
        }

        let coordinator = Arc::new(WorkCoordinator::new());
        coordinator.begin_work(1);
        let shared = Arc::new(SearchShared {
            tree,
            options: self.options.clone(),
            stats: SearchStats::new(),
            coordinator: Arc::clone(&coordinator),
            cache: Arc::clone(&self.cache),
            network: Arc::clone(&self.network),
            tablebase: self.tablebase.clone(),
            time_control,
            search_moves,
            start: Instant::now(),
            last_cache_flush: Arc::clone(&self.last_cache_flush),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("search-main".into())
                .spawn(move || run_search(&shared))
                .map_err(|e| anyhow!("failed to spawn search thread: {e}"))?
        };

        self.session = Some(SearchSession {
            shared,
            coordinator,
            handle,
        });
        Ok(())
    }

    /// Signal stop; the session finishes its in-flight iterations, prints the
    /// best move, and unwinds.
    pub fn stop(&mut self) {
        if let Some(session) = &self.session {
            session.coordinator.request_stop();
        }
    }

    /// Block until a running search stops on its own (budget, clock, mate),
    /// then reclaim the tree. Never use under `go infinite`.
    pub fn wait_until_finished(&mut self) {
        while let Some(session) = &self.session {
            if session.handle.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.wait();
    }

    /// Join the session (if any) and take the tree back for reuse.
    pub fn wait(&mut self) {
        if let Some(session) = self.session.take() {
            session.coordinator.request_stop();
            let _ = session.handle.join();
            match Arc::try_unwrap(session.shared) {
                Ok(shared) => self.tree = Some(shared.tree),
                Err(_) => unreachable!("all workers exited, session must be sole owner"),
            }
        }
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    /// Root introspection for tests and debugging: (root visit count, legal
    /// moves known to the tree). `None` while a search is running or before
    /// the root has been expanded.
    pub fn debug_root(&self) -> Option<(u32, Vec<String>)> {
        let tree = self.tree.as_ref()?;
        let children = tree.root.children()?;
        let moves = children
            .iter()
            .map(|child| crate::game::decode_move(child.encoded_move()).to_string())
            .collect();
        Some((tree.root.visit_count(), moves))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.wait();
    }
}

/// Session main: spawn the workers, join them, choose and print the move.
fn run_search(shared: &SearchShared) {
    let threads = shared.options.search_threads;
    std::thread::scope(|scope| {
        for worker_index in 0..threads {
            let shared = &*shared;
            scope.spawn(move || run_search_worker(shared, worker_index));
        }
    });

    // Finalizing: workers have unwound their slots; pick the move to play.
    let root = &shared.tree.root;
    let game = &shared.tree.game;
    let mut rng = seeded_rng();
    let selected = select_move(root, game, &shared.options, PlayMode::Search, &mut rng);

    print_info_line(shared, true);
    match selected {
        Some((_, mv)) => println!("bestmove {mv}"),
        None => {
            // Terminal root: nothing to search, nothing to play.
            println!("bestmove 0000");
        }
    }
}

fn run_search_worker(shared: &SearchShared, worker_index: usize) {
    let ctx = SearchContext {
        options: &shared.options,
        cache: &shared.cache,
        tablebase: shared.tablebase.as_deref(),
        stats: &shared.stats,
        searching: true,
        search_moves: &shared.search_moves,
    };
    let root = &shared.tree.root;
    let game = &shared.tree.game;
    let mut worker = BatchWorker::new(shared.options.prediction_batch_size);
    let mut ranks_applied = false;
    let mut last_print = Instant::now();
    let legal_move_count = game.legal_moves().len();

    while !shared.coordinator.is_stopping() {
        // Slowstart: while the tree is tiny, only the first few threads run,
        // and those at reduced parallelism, so the root's early shape is not
        // decided by a thundering herd of uniform priors.
        let visits = root.visit_count();
        let parallelism = if visits < shared.options.slowstart_nodes {
            // Worker 0 always runs; it owns the stop check.
            if worker_index >= shared.options.slowstart_threads.max(1) {
                std::thread::yield_now();
                continue;
            }
            shared.options.slowstart_parallelism
        } else {
            worker.slot_count()
        };

        let report = match worker.tick(
            &ctx,
            root,
            game,
            shared.network.as_ref(),
            NetworkKind::Full,
            parallelism,
        ) {
            Ok(report) => report,
            Err(error) => {
                // The search cannot continue without evaluations.
                log::error!("prediction pipeline failed: {error}");
                shared.coordinator.request_stop();
                break;
            }
        };

        if report.status.contains(PredictStatus::UPDATED_NETWORK) {
            maybe_flush_cache(shared);
        }

        if !ranks_applied && root.children().is_some() {
            if let Some(tablebase) = shared.tablebase.as_deref() {
                apply_root_tablebase_ranks(root, tablebase, game);
            }
            ranks_applied = true;
        }

        if worker_index == 0 {
            let best_mate = root.best_child().and_then(|child| match child.terminal() {
                TerminalValue::MateIn(k) => Some(k),
                _ => None,
            });
            if should_stop(
                &shared.time_control,
                &shared.options,
                &shared.stats,
                shared.start.elapsed(),
                game.side_to_move(),
                legal_move_count,
                best_mate,
            ) {
                shared.coordinator.request_stop();
                break;
            }

            let due = last_print.elapsed() >= Duration::from_millis(PV_PRINT_INTERVAL_MS);
            if shared.stats.take_pv_changed() || due {
                print_info_line(shared, false);
                last_print = Instant::now();
            }
        }
    }

    // Finalize this worker's slots: every in-flight path unwinds so visiting
    // counts return to zero and claimed expansions reopen.
    worker.interrupt_all();
}

fn maybe_flush_cache(shared: &SearchShared) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let last = shared.last_cache_flush.load(Ordering::Relaxed);
    if now.saturating_sub(last) >= CACHE_FLUSH_INTERVAL_SECS || last == 0 {
        if shared
            .last_cache_flush
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            shared.cache.clear();
            log::info!("network updated; prediction cache flushed");
        }
    }
}

/// Win probability for the side to move -> approximate centipawns.
fn value_to_centipawns(value: f32) -> i32 {
    let clamped = value.clamp(0.001, 0.999);
    let odds = clamped / (1.0 - clamped);
    (290.0 * odds.log10()) as i32
}

fn print_info_line(shared: &SearchShared, final_line: bool) {
    let root = &shared.tree.root;
    let elapsed = shared.start.elapsed();
    let nodes = shared.stats.node_count.load(Ordering::Relaxed);
    let nps = (nodes as f64 / elapsed.as_secs_f64().max(1e-3)) as u64;

    // Terminal root: report its score at depth zero.
    let Some(best) = root.best_child() else {
        if let Some(value) = root.terminal().value() {
            let cp = value_to_centipawns(flip_value(value));
            println!("info depth 0 score cp {cp} nodes {nodes} time {}", elapsed.as_millis());
        }
        return;
    };

    let pv = principal_variation(root, 24);
    let score = match best.terminal() {
        TerminalValue::MateIn(k) => format!("mate {k}"),
        TerminalValue::OpponentMateIn(k) => format!("mate -{k}"),
        _ => format!("cp {}", value_to_centipawns(best.value())),
    };

    let pv_text = pv
        .iter()
        .map(|mv| mv.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let depth = pv.len().max(1);
    let hashfull = shared.cache.permille_full();
    println!(
        "info depth {depth} score {score} nodes {nodes} nps {nps} hashfull {hashfull} time {} pv {pv_text}",
        elapsed.as_millis()
    );
    if final_line {
        log::debug!(
            "search done: {} nodes, {} failed, {} tablebase hits, hits {} permille",
            nodes,
            shared.stats.failed_node_count.load(Ordering::Relaxed),
            shared.stats.tablebase_hit_count.load(Ordering::Relaxed),
            shared.cache.permille_hits(),
        );
    }
}
