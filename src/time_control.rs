use chess::Color;
use std::time::Duration;

use crate::config::EngineOptions;
use crate::mcts::SearchStats;
use std::sync::atomic::Ordering;

/// Limits parsed from the protocol's `go` arguments.
#[derive(Debug, Clone, Default)]
pub struct TimeControl {
    pub infinite: bool,
    pub pondering: bool,
    pub move_time_ms: Option<u64>,
    pub nodes: Option<u64>,
    pub mate_in: Option<u32>,
    pub moves_to_go: Option<u32>,
    pub white_time_ms: Option<u64>,
    pub black_time_ms: Option<u64>,
    pub white_inc_ms: Option<u64>,
    pub black_inc_ms: Option<u64>,
}

impl TimeControl {
    pub fn movetime(ms: u64) -> Self {
        Self {
            move_time_ms: Some(ms),
            ..Default::default()
        }
    }

    pub fn infinite() -> Self {
        Self {
            infinite: true,
            ..Default::default()
        }
    }

    fn remaining_ms(&self, side: Color) -> Option<u64> {
        match side {
            Color::White => self.white_time_ms,
            Color::Black => self.black_time_ms,
        }
    }

    fn increment_ms(&self, side: Color) -> u64 {
        match side {
            Color::White => self.white_inc_ms.unwrap_or(0),
            Color::Black => self.black_inc_ms.unwrap_or(0),
        }
    }

    /// Game-clock budget for this move: a configured fraction of the
    /// remaining time excluding the increment, plus the increment, capped by
    /// the remaining time, shaved by the safety buffer, floored at the
    /// absolute minimum.
    pub fn allowed_clock_ms(&self, options: &EngineOptions, side: Color) -> Option<u64> {
        let remaining = self.remaining_ms(side)? as f32;
        let increment = self.increment_ms(side) as f32;
        let mut fraction = options.time_control_fraction_of_remaining;
        if let Some(moves_to_go) = self.moves_to_go {
            fraction = fraction.min(moves_to_go.max(1) as f32);
        }
        let budget = (fraction * (remaining - increment).max(0.0) + increment).min(remaining)
            - options.safety_buffer_ms as f32;
        Some((budget.max(0.0) as u64).max(options.absolute_minimum_ms))
    }
}

/// Once a forced mate is proven, spend at most this long confirming it.
const MATE_CONFIRM_MS: u64 = 3_000;

/// Decide whether the search should stop, and republish the elimination
/// fraction so the selector's top-K keeps contracting with progress.
/// Checked by the primary worker between iterations.
pub fn should_stop(
    time_control: &TimeControl,
    options: &EngineOptions,
    stats: &SearchStats,
    elapsed: Duration,
    side: Color,
    legal_move_count: usize,
    best_mate_distance: Option<u8>,
) -> bool {
    let elapsed_ms = elapsed.as_millis() as u64;
    let node_count = stats.node_count.load(Ordering::Relaxed);

    // Elimination progress tracks whichever budget binds.
    let progress = if let Some(nodes) = time_control.nodes {
        node_count as f32 / nodes.max(1) as f32
    } else if let Some(move_time) = time_control.move_time_ms {
        elapsed_ms as f32 / move_time.max(1) as f32
    } else if let Some(allowed) = time_control.allowed_clock_ms(options, side) {
        elapsed_ms as f32 / allowed.max(1) as f32
    } else {
        0.0
    };
    stats.set_elimination_fraction(progress);

    if time_control.infinite {
        return false;
    }

    if let (Some(mate_in), Some(distance)) = (time_control.mate_in, best_mate_distance) {
        if distance as u32 <= mate_in {
            return true;
        }
    }

    if let Some(nodes) = time_control.nodes {
        if node_count >= nodes {
            return true;
        }
    }

    if let Some(move_time) = time_control.move_time_ms {
        if elapsed_ms >= move_time {
            return true;
        }
    }

    if let Some(allowed) = time_control.allowed_clock_ms(options, side) {
        if elapsed_ms >= allowed {
            return true;
        }
    }

    if !time_control.pondering {
        if legal_move_count == 1 && node_count > 0 {
            return true;
        }
        if best_mate_distance.is_some() && elapsed_ms >= MATE_CONFIRM_MS {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with_nodes(nodes: u64) -> SearchStats {
        let stats = SearchStats::new();
        stats.node_count.store(nodes, Ordering::Relaxed);
        stats
    }

    #[test]
    fn infinite_never_stops() {
        let options = EngineOptions::default();
        let stats = stats_with_nodes(1_000_000);
        assert!(!should_stop(
            &TimeControl::infinite(),
            &options,
            &stats,
            Duration::from_secs(3600),
            Color::White,
            30,
            Some(1),
        ));
    }

    #[test]
    fn movetime_binds() {
        let options = EngineOptions::default();
        let stats = stats_with_nodes(10);
        let tc = TimeControl::movetime(500);
        assert!(!should_stop(
            &tc,
            &options,
            &stats,
            Duration::from_millis(100),
            Color::White,
            30,
            None,
        ));
        assert!(should_stop(
            &tc,
            &options,
            &stats,
            Duration::from_millis(501),
            Color::White,
            30,
            None,
        ));
    }

    #[test]
    fn node_budget_binds() {
        let options = EngineOptions::default();
        let stats = stats_with_nodes(800);
        let tc = TimeControl {
            nodes: Some(800),
            ..Default::default()
        };
        assert!(should_stop(
            &tc,
            &options,
            &stats,
            Duration::from_millis(1),
            Color::White,
            30,
            None,
        ));
    }

    #[test]
    fn single_legal_move_stops_unless_pondering() {
        let options = EngineOptions::default();
        let stats = stats_with_nodes(5);
        let tc = TimeControl {
            white_time_ms: Some(60_000),
            ..Default::default()
        };
        assert!(should_stop(
            &tc,
            &options,
            &stats,
            Duration::from_millis(1),
            Color::White,
            1,
            None,
        ));
        let pondering = TimeControl {
            pondering: true,
            white_time_ms: Some(60_000),
            ..Default::default()
        };
        assert!(!should_stop(
            &pondering,
            &options,
            &stats,
            Duration::from_millis(1),
            Color::White,
            1,
            None,
        ));
    }

    #[test]
    fn mate_target_stops_at_distance() {
        let options = EngineOptions::default();
        let stats = stats_with_nodes(5);
        let tc = TimeControl {
            mate_in: Some(2),
            ..Default::default()
        };
        assert!(should_stop(
            &tc,
            &options,
            &stats,
            Duration::from_millis(1),
            Color::White,
            20,
            Some(2),
        ));
        assert!(!should_stop(
            &tc,
            &options,
            &stats,
            Duration::from_millis(1),
            Color::White,
            20,
            Some(3),
        ));
    }

    #[test]
    fn clock_budget_respects_floors_and_buffer() {
        let options = EngineOptions::default();
        let tc = TimeControl {
            white_time_ms: Some(60_000),
            white_inc_ms: Some(1_000),
            ..Default::default()
        };
        let allowed = tc.allowed_clock_ms(&options, Color::White).unwrap();
        assert!(allowed >= options.absolute_minimum_ms);
        assert!(allowed < 60_000);

        let desperate = TimeControl {
            white_time_ms: Some(40),
            ..Default::default()
        };
        let floor = desperate.allowed_clock_ms(&options, Color::White).unwrap();
        assert_eq!(floor, options.absolute_minimum_ms);
    }

    #[test]
    fn elimination_fraction_tracks_progress() {
        let options = EngineOptions::default();
        let stats = stats_with_nodes(400);
        let tc = TimeControl {
            nodes: Some(800),
            ..Default::default()
        };
        should_stop(
            &tc,
            &options,
            &stats,
            Duration::from_millis(1),
            Color::White,
            30,
            None,
        );
        let fraction = stats.elimination_fraction();
        assert!((fraction - 0.5).abs() < 1e-3);
    }
}
