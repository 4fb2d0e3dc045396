use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tch::{Cuda, Device};

use kestrel::cache::PredictionCache;
use kestrel::config::EngineOptions;
use kestrel::engine::Engine;
use kestrel::network::{AlphaZeroNet, Network, UniformNetwork};
use kestrel::selfplay::{generate_games, SelfPlayParams};
use kestrel::tablebase::Tablebase;
use kestrel::uci::UciEngine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Neural-network chess engine", long_about = None)]
struct Args {
    /// Operation mode: 'uci' or 'selfplay'.
    #[arg(long, default_value = "uci")]
    mode: String,

    /// Path to serving weights (.pt). Untrained uniform network if omitted.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Syzygy tablebase directory.
    #[arg(long)]
    syzygy: Option<PathBuf>,

    /// Search threads.
    #[arg(long)]
    threads: Option<usize>,

    /// Parallel prediction slots per worker.
    #[arg(long)]
    slots: Option<usize>,

    /// Prediction cache size request, power-of-two GiB (0 disables).
    #[arg(long)]
    cache_gib: Option<u64>,

    /// Minimum acceptable cache size in GiB.
    #[arg(long)]
    cache_min_gib: Option<u64>,

    /// Self-play: number of games to generate.
    #[arg(long, default_value_t = 100)]
    games: usize,

    /// Self-play: simulations per move.
    #[arg(long)]
    simulations: Option<u32>,

    /// Self-play: worker threads.
    #[arg(long)]
    workers: Option<usize>,

    /// Self-play: output path for JSON-lines game records.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn optimal_device() -> Device {
    if Cuda::is_available() {
        log::info!("using CUDA ({} devices)", Cuda::device_count());
        Device::Cuda(0)
    } else {
        log::info!("using CPU");
        Device::Cpu
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut options = EngineOptions::default();
    if let Some(threads) = args.threads {
        options.search_threads = threads;
    }
    if let Some(slots) = args.slots {
        options.prediction_batch_size = slots;
    }
    if let Some(cache_gib) = args.cache_gib {
        options.cache_gib = cache_gib;
        options.cache_min_gib = options.cache_min_gib.min(cache_gib);
    }
    if let Some(cache_min_gib) = args.cache_min_gib {
        options.cache_min_gib = cache_min_gib;
    }
    if let Some(simulations) = args.simulations {
        options.num_simulations = simulations;
    }
    if let Some(workers) = args.workers {
        options.selfplay_workers = workers;
    }
    options.validate()?;

    let network: Arc<dyn Network> = match &args.model {
        Some(path) => {
            log::info!("loading model from {}", path.display());
            Arc::new(AlphaZeroNet::load_from_file(path, optimal_device())?)
        }
        None => {
            log::warn!("no model given; using an untrained uniform network");
            Arc::new(UniformNetwork)
        }
    };

    let tablebase = match &args.syzygy {
        Some(path) => Some(Arc::new(Tablebase::new(path)?)),
        None => None,
    };

    match args.mode.as_str() {
        "selfplay" => {
            let mut cache = PredictionCache::new();
            cache.allocate(options.cache_gib, options.cache_min_gib)?;
            let params = SelfPlayParams {
                games: args.games,
                workers: options.selfplay_workers,
                output_path: args.output.clone(),
            };
            let records = generate_games(
                &params,
                &options,
                network.as_ref(),
                &cache,
                tablebase.as_deref(),
            )?;
            println!("generated {} games", records.len());
            Ok(())
        }
        _ => {
            let engine = Engine::new(options, network, tablebase)?;
            UciEngine::new(engine).run_loop();
            Ok(())
        }
    }
}
