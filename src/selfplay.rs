use anyhow::Result;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cache::PredictionCache;
use crate::config::{EngineOptions, MAX_GAME_PLIES};
use crate::encoder::{InputPlanes, INPUT_SIZE, POLICY_SIZE};
use crate::game::{decode_move, Game};
use crate::mcts::{
    add_exploration_noise, run_mcts, seeded_rng, select_move, MctsOutcome, PlayMode,
    SearchContext, SearchSlot, SearchStats, SlotState,
};
use crate::coordinator::WorkCoordinator;
use crate::network::{Network, NetworkKind};
use crate::node::{Node, TerminalValue};
use crate::tablebase::Tablebase;

#[derive(Clone)]
pub struct SelfPlayParams {
    pub games: usize,
    pub workers: usize,
    pub output_path: Option<PathBuf>,
}

/// One finished training game: the move list, the result from white's
/// perspective, and the per-move normalized visit distributions the policy
/// head trains against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub moves: Vec<String>,
    /// 1 white win, 0 draw, -1 black win.
    pub result: i8,
    pub search_policies: Vec<Vec<(String, f32)>>,
}

/// One in-progress game bound to a prediction slot: its own tree, its own
/// scratch state machine, and its accumulating record.
struct GameSlot {
    search: SearchSlot,
    game: Game,
    root: Box<Node>,
    simulations: u32,
    noise_added: bool,
    record: GameRecord,
}

impl GameSlot {
    fn new() -> Self {
        Self {
            search: SearchSlot::new(),
            game: Game::startpos(),
            root: Box::new(Node::new(0, 0, 0.0)),
            simulations: 0,
            noise_added: false,
            record: GameRecord {
                moves: Vec::new(),
                result: 0,
                search_policies: Vec::new(),
            },
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Only positions that are over on the board end the game: checkmate
    /// (stored as mate-in-1), a stored draw, or the ply cap. A root that
    /// merely proves a forced mate ahead keeps playing it out.
    fn is_game_over(&self) -> bool {
        matches!(
            self.root.terminal(),
            TerminalValue::MateIn(1) | TerminalValue::Draw
        ) || self.game.ply() as usize >= MAX_GAME_PLIES
    }

    /// Result from white's perspective. A checkmated root was lost by the
    /// side to move there; everything else coalesces to a draw.
    fn final_result(&self) -> i8 {
        match self.root.terminal() {
            TerminalValue::MateIn(_) => match self.game.side_to_move() {
                chess::Color::White => -1,
                chess::Color::Black => 1,
            },
            _ => 0,
        }
    }

    fn store_search_statistics(&mut self) {
        let Some(children) = self.root.children() else {
            return;
        };
        let total: u64 = children.iter().map(|c| c.visit_count() as u64).sum();
        if total == 0 {
            return;
        }
        let distribution = children
            .iter()
            .filter(|c| c.visit_count() > 0)
            .map(|c| {
                (
                    decode_move(c.encoded_move()).to_string(),
                    c.visit_count() as f32 / total as f32,
                )
            })
            .collect();
        self.record.search_policies.push(distribution);
    }
}

/// Drives `prediction_batch_size` concurrent games through the shared
/// network, one batch per scheduling round. The stopping and clock logic of
/// the search path is absent; every move gets exactly `num_simulations`.
pub struct SelfPlayWorker {
    slots: Vec<GameSlot>,
    pending: Vec<usize>,
    images: Vec<InputPlanes>,
    values: Vec<f32>,
    policies: Vec<f32>,
    rng: SmallRng,
}

impl SelfPlayWorker {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| GameSlot::new()).collect(),
            pending: Vec::with_capacity(slot_count),
            images: vec![[0f32; INPUT_SIZE]; slot_count],
            values: vec![0f32; slot_count],
            policies: vec![0f32; slot_count * POLICY_SIZE],
            rng: seeded_rng(),
        }
    }

    /// Generate games until the coordinator's work count runs out. Finished
    /// records are pushed into `sink`.
    pub fn play_games(
        &mut self,
        ctx: &SearchContext,
        network: &dyn Network,
        coordinator: &WorkCoordinator,
        sink: &Mutex<Vec<GameRecord>>,
    ) -> Result<()> {
        while !coordinator.all_work_items_completed() && !coordinator.is_stopping() {
            for index in 0..self.slots.len() {
                self.step_slot(ctx, index, None, coordinator, sink);
            }

            if self.pending.is_empty() {
                continue;
            }
            for image in self.images[self.pending.len()..].iter_mut() {
                image.fill(0.0);
            }
            network.predict_batch(
                NetworkKind::Full,
                &self.images,
                &mut self.values,
                &mut self.policies,
            )?;

            let pending = std::mem::take(&mut self.pending);
            for (batch_position, slot_index) in pending.into_iter().enumerate() {
                let value = self.values[batch_position];
                let policy_start = batch_position * POLICY_SIZE;
                let policy: Vec<f32> =
                    self.policies[policy_start..policy_start + POLICY_SIZE].to_vec();
                self.step_slot(ctx, slot_index, Some((value, policy)), coordinator, sink);
            }
        }
        Ok(())
    }

    /// Advance one game as far as it can go on CPU alone; park it when it
    /// needs the network.
    fn step_slot(
        &mut self,
        ctx: &SearchContext,
        index: usize,
        mut prediction: Option<(f32, Vec<f32>)>,
        coordinator: &WorkCoordinator,
        sink: &Mutex<Vec<GameRecord>>,
    ) {
        loop {
            let slot = &mut self.slots[index];

            if slot.search.state == SlotState::WaitingForPrediction && prediction.is_none() {
                return;
            }

            if slot.is_game_over() {
                if coordinator.all_work_items_completed() {
                    return;
                }
                slot.record.result = slot.final_result();
                let record = std::mem::replace(
                    &mut slot.record,
                    GameRecord {
                        moves: Vec::new(),
                        result: 0,
                        search_policies: Vec::new(),
                    },
                );
                sink.lock().unwrap().push(record);
                coordinator.on_work_item_completed();
                slot.reset();
                continue;
            }

            // Dirichlet noise goes in once per move, as soon as the root has
            // children to perturb.
            if !slot.noise_added && slot.root.children().is_some() {
                add_exploration_noise(&slot.root, ctx.options, &mut self.rng);
                slot.noise_added = true;
                continue;
            }

            if slot.simulations >= ctx.options.num_simulations {
                let selected = select_move(
                    &slot.root,
                    &slot.game,
                    ctx.options,
                    PlayMode::SelfPlay,
                    &mut self.rng,
                );
                let Some((child_index, mv)) = selected else {
                    // Defensive: a searched root with no selectable child
                    // plays nothing and scores as it stands.
                    slot.record.result = slot.final_result();
                    return;
                };
                slot.store_search_statistics();
                slot.record.moves.push(mv.to_string());
                slot.game.apply_move(mv);
                let root = std::mem::replace(&mut slot.root, Box::new(Node::new(0, 0, 0.0)));
                slot.root = root.detach_child(child_index);
                slot.simulations = 0;
                slot.noise_added = false;
                continue;
            }

            let outcome = match prediction.take() {
                Some((value, policy)) => run_mcts(
                    ctx,
                    &slot.root,
                    &slot.game,
                    &mut slot.search,
                    Some((value, policy.as_slice())),
                ),
                None => run_mcts(ctx, &slot.root, &slot.game, &mut slot.search, None),
            };
            match outcome {
                MctsOutcome::Completed => slot.simulations += 1,
                MctsOutcome::NotReady => {}
                MctsOutcome::WaitingForPrediction => {
                    let batch_position = self.pending.len();
                    self.images[batch_position] = slot.search.image;
                    self.pending.push(index);
                    return;
                }
            }
        }
    }
}

/// Run `params.games` self-play games across `params.workers` threads, all
/// sharing one prediction cache and network. Records are optionally written
/// as JSON lines.
pub fn generate_games(
    params: &SelfPlayParams,
    options: &EngineOptions,
    network: &dyn Network,
    cache: &PredictionCache,
    tablebase: Option<&Tablebase>,
) -> Result<Vec<GameRecord>> {
    let coordinator = WorkCoordinator::new();
    coordinator.begin_work(params.games as i64);
    let sink = Mutex::new(Vec::with_capacity(params.games));
    let stats = SearchStats::new();

    let worker_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    rayon::scope(|scope| {
        for _ in 0..params.workers.max(1) {
            scope.spawn(|_| {
                let ctx = SearchContext {
                    options,
                    cache,
                    tablebase,
                    stats: &stats,
                    searching: false,
                    search_moves: &[],
                };
                let mut worker = SelfPlayWorker::new(options.prediction_batch_size);
                if let Err(error) = worker.play_games(&ctx, network, &coordinator, &sink) {
                    coordinator.request_stop();
                    *worker_error.lock().unwrap() = Some(error);
                }
            });
        }
    });
    if let Some(error) = worker_error.into_inner().unwrap() {
        return Err(error);
    }

    let mut records = sink.into_inner().unwrap();
    records.truncate(params.games);
    if let Some(path) = &params.output_path {
        save_records(path, &records)?;
    }
    log::info!(
        "self-play complete: {} games, cache hits {} permille",
        records.len(),
        cache.permille_hits()
    );
    Ok(records)
}

/// JSON-lines writer, one record per line.
pub fn save_records(path: &Path, records: &[GameRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn load_records(path: &Path) -> Result<Vec<GameRecord>> {
    let text = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}
