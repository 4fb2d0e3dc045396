use anyhow::Result;
use chess::{Board, ChessMove, MoveGen};
use shakmaty::fen::Fen;
use shakmaty::CastlingMode;
use shakmaty_syzygy::{Tablebase as SyzygyTablebase, Wdl as SyzygyWdl};
use std::path::Path;

use crate::node::Bound;

/// WDL from the probed side to move's perspective. Cursed wins and blessed
/// losses are wins and losses the 50-move rule converts to draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wdl {
    Loss,
    BlessedLoss,
    Draw,
    CursedWin,
    Win,
}

impl Wdl {
    fn from_syzygy(wdl: SyzygyWdl) -> Self {
        match wdl {
            SyzygyWdl::Loss => Wdl::Loss,
            SyzygyWdl::BlessedLoss => Wdl::BlessedLoss,
            SyzygyWdl::Draw => Wdl::Draw,
            SyzygyWdl::CursedWin => Wdl::CursedWin,
            SyzygyWdl::Win => Wdl::Win,
        }
    }

    /// Bound and proven score for a node holding this position, seen from the
    /// node's parent. A win for the probed side is a loss for the player who
    /// moved in; 50-move-limited results are exact draws.
    pub fn bound_for_parent(self) -> Bound {
        match self {
            Wdl::Win => Bound::Upper,
            Wdl::Loss => Bound::Lower,
            Wdl::Draw | Wdl::CursedWin | Wdl::BlessedLoss => Bound::Exact,
        }
    }
}

/// One root move with its tablebase rank; higher ranks are strictly better
/// and outrank any visit count.
#[derive(Debug, Clone, Copy)]
pub struct RankedMove {
    pub mv: ChessMove,
    pub rank: i16,
}

/// Syzygy endgame tables. Boards convert through FEN only at probe-eligible
/// piece counts, so the conversion cost never touches the common path.
pub struct Tablebase {
    tables: SyzygyTablebase<shakmaty::Chess>,
    max_pieces: usize,
}

impl Tablebase {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut tables = SyzygyTablebase::new();
        let count = tables.add_directory(path.as_ref())?;
        let max_pieces = tables.max_pieces();
        log::info!("loaded {count} syzygy tables, up to {max_pieces} pieces");
        Ok(Self { tables, max_pieces })
    }

    #[inline]
    pub fn max_pieces(&self) -> usize {
        self.max_pieces
    }

    /// Interior probes happen only at zero-progress positions with few enough
    /// pieces; anything else is a guaranteed miss.
    #[inline]
    pub fn can_probe(&self, board: &Board, rule50: u32) -> bool {
        rule50 == 0 && board.combined().popcnt() as usize <= self.max_pieces
    }

    fn to_shakmaty(board: &Board) -> Option<shakmaty::Chess> {
        let fen: Fen = format!("{board}").parse().ok()?;
        fen.into_position(CastlingMode::Standard).ok()
    }

    /// WDL for the side to move, or `None` on any miss.
    pub fn probe_wdl(&self, board: &Board, rule50: u32) -> Option<Wdl> {
        if !self.can_probe(board, rule50) {
            return None;
        }
        let position = Self::to_shakmaty(board)?;
        self.tables
            .probe_wdl_after_zeroing(&position)
            .ok()
            .map(Wdl::from_syzygy)
    }

    /// Rank every root move. Wins sort above cursed wins above draws above
    /// losses; within the winning bands shorter distance-to-zeroing ranks
    /// higher, within the losing bands longer resistance ranks higher.
    pub fn probe_root(&self, board: &Board) -> Option<Vec<RankedMove>> {
        if board.combined().popcnt() as usize > self.max_pieces {
            return None;
        }
        let mut ranked = Vec::new();
        for mv in MoveGen::new_legal(board) {
            let child = board.make_move_new(mv);
            let position = Self::to_shakmaty(&child)?;
            let child_wdl = self.tables.probe_wdl_after_zeroing(&position).ok()?;
            let dtz = self
                .tables
                .probe_dtz(&position)
                .ok()
                .map(|d| d.ignore_rounding().0)
                .unwrap_or(0);
            // Child results are from the opponent's perspective; negate.
            let wdl = Wdl::from_syzygy(-child_wdl);
            let distance = (dtz.unsigned_abs() as i16).min(900);
            let rank = match wdl {
                Wdl::Win => 2000 - distance,
                Wdl::CursedWin => 1000 - distance,
                Wdl::Draw => 0,
                Wdl::BlessedLoss => -1000 - distance,
                Wdl::Loss => -2000 - distance,
            };
            ranked.push(RankedMove { mv, rank });
        }
        Some(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wdl_bounds_flip_to_parent_perspective() {
        assert_eq!(Wdl::Win.bound_for_parent(), Bound::Upper);
        assert_eq!(Wdl::Loss.bound_for_parent(), Bound::Lower);
        assert_eq!(Wdl::Draw.bound_for_parent(), Bound::Exact);
        assert_eq!(Wdl::CursedWin.bound_for_parent(), Bound::Exact);
        assert_eq!(Wdl::BlessedLoss.bound_for_parent(), Bound::Exact);
    }
}
