use chess::ChessMove;
use std::io::{self, BufRead};

use crate::engine::Engine;
use crate::time_control::TimeControl;

/// UCI front end over the engine's state machine. One command per line;
/// searches run on their own threads so `stop` stays responsive.
pub struct UciEngine {
    engine: Engine,
}

impl UciEngine {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    fn cmd_uci(&self) {
        println!("id name kestrel");
        println!("id author the kestrel authors");
        println!("option name Threads type spin default 4 min 1 max 256");
        println!("option name SlotsPerThread type spin default 128 min 1 max 512");
        println!("option name CacheGiB type spin default 2 min 0 max 256");
        println!("option name NumSimulations type spin default 800 min 1 max 1000000");
        println!("option name MoveDiversityPlies type spin default 10 min 0 max 100");
        println!("uciok");
    }

    fn cmd_isready(&mut self) {
        println!("readyok");
    }

    fn cmd_setoption(&mut self, args: &str) {
        // "name <Name> value <Value>"
        let mut name = String::new();
        let mut value = String::new();
        let mut target: Option<&mut String> = None;
        for token in args.split_whitespace() {
            match token {
                "name" => target = Some(&mut name),
                "value" => target = Some(&mut value),
                other => {
                    if let Some(buffer) = target.as_deref_mut() {
                        if !buffer.is_empty() {
                            buffer.push(' ');
                        }
                        buffer.push_str(other);
                    }
                }
            }
        }

        let options = self.engine.options_mut();
        let parsed = match name.as_str() {
            "Threads" => value.parse().map(|v| options.search_threads = v).is_ok(),
            "SlotsPerThread" => value
                .parse()
                .map(|v| options.prediction_batch_size = v)
                .is_ok(),
            "CacheGiB" => value.parse().map(|v| options.cache_gib = v).is_ok(),
            "NumSimulations" => value.parse().map(|v| options.num_simulations = v).is_ok(),
            "MoveDiversityPlies" => value
                .parse()
                .map(|v| options.move_diversity_plies = v)
                .is_ok(),
            _ => {
                log::warn!("unknown option {name:?}");
                true
            }
        };
        if !parsed {
            log::warn!("bad value {value:?} for option {name:?}");
        }
    }

    fn cmd_ucinewgame(&mut self) {
        self.engine.new_game();
    }

    fn cmd_position(&mut self, args: &str) {
        let mut tokens = args.split_whitespace().peekable();
        let fen = match tokens.next() {
            Some("startpos") => None,
            Some("fen") => {
                let fields: Vec<&str> = tokens.by_ref().take(6).collect();
                if fields.len() != 6 {
                    log::warn!("malformed FEN in position command");
                    return;
                }
                Some(fields.join(" "))
            }
            _ => return,
        };
        let moves: Vec<String> = match tokens.next() {
            Some("moves") => tokens.map(str::to_owned).collect(),
            _ => Vec::new(),
        };
        if let Err(error) = self.engine.set_position(fen.as_deref(), &moves) {
            log::warn!("position rejected: {error}");
        }
    }

    fn cmd_go(&mut self, args: &str) {
        let mut time_control = TimeControl::default();
        let mut search_moves: Vec<ChessMove> = Vec::new();
        let mut tokens = args.split_whitespace().peekable();

        while let Some(token) = tokens.next() {
            match token {
                "infinite" => time_control.infinite = true,
                "ponder" => time_control.pondering = true,
                "movetime" => {
                    time_control.move_time_ms = tokens.next().and_then(|t| t.parse().ok());
                }
                "nodes" => {
                    time_control.nodes = tokens.next().and_then(|t| t.parse().ok());
                }
                "mate" => {
                    time_control.mate_in = tokens.next().and_then(|t| t.parse().ok());
                }
                "movestogo" => {
                    time_control.moves_to_go = tokens.next().and_then(|t| t.parse().ok());
                }
                "wtime" => {
                    time_control.white_time_ms = tokens.next().and_then(|t| t.parse().ok());
                }
                "btime" => {
                    time_control.black_time_ms = tokens.next().and_then(|t| t.parse().ok());
                }
                "winc" => {
                    time_control.white_inc_ms = tokens.next().and_then(|t| t.parse().ok());
                }
                "binc" => {
                    time_control.black_inc_ms = tokens.next().and_then(|t| t.parse().ok());
                }
                "searchmoves" => {
                    while let Some(candidate) = tokens.peek() {
                        match candidate.parse::<ChessMove>() {
                            Ok(mv) => {
                                search_moves.push(mv);
                                tokens.next();
                            }
                            Err(_) => break,
                        }
                    }
                }
                _ => {}
            }
        }

        if let Err(error) = self.engine.go(time_control, search_moves) {
            log::error!("go failed: {error}");
            println!("bestmove 0000");
        }
    }

    pub fn run_loop(&mut self) {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(text) => text.trim().to_string(),
                Err(_) => break,
            };
            if line.is_empty() {
                continue;
            }
            if line == "uci" {
                self.cmd_uci();
            } else if line == "isready" {
                self.cmd_isready();
            } else if line == "ucinewgame" {
                self.cmd_ucinewgame();
            } else if line == "stop" {
                self.engine.stop();
                self.engine.wait();
            } else if line == "quit" {
                break;
            } else if let Some(rest) = line.strip_prefix("setoption ") {
                self.cmd_setoption(rest);
            } else if let Some(rest) = line.strip_prefix("position ") {
                self.cmd_position(rest);
            } else if let Some(rest) = line.strip_prefix("go") {
                self.cmd_go(rest.trim_start());
            }
        }
        self.engine.wait();
    }
}
