use anyhow::{anyhow, Result};
use chess::{Board, BoardStatus, ChessMove, Color, MoveGen, Piece, ALL_SQUARES};
use std::str::FromStr;

pub const VALUE_LOSS: f32 = 0.0;
pub const VALUE_DRAW: f32 = 0.5;
pub const VALUE_WIN: f32 = 1.0;

/// Flip a win probability to the other side's perspective.
#[inline]
pub fn flip_value(value: f32) -> f32 {
    1.0 - value
}

/// 16-bit move encoding: from | to << 6 | promotion << 12.
/// Promotion: 0 none, 1 knight, 2 bishop, 3 rook, 4 queen.
#[inline]
pub fn encode_move(mv: ChessMove) -> u16 {
    let promo = match mv.get_promotion() {
        None => 0u16,
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        Some(_) => 0,
    };
    mv.get_source().to_index() as u16 | ((mv.get_dest().to_index() as u16) << 6) | (promo << 12)
}

#[inline]
pub fn decode_move(encoded: u16) -> ChessMove {
    let from = ALL_SQUARES[(encoded & 0x3F) as usize];
    let to = ALL_SQUARES[((encoded >> 6) & 0x3F) as usize];
    let promo = match (encoded >> 12) & 0x7 {
        1 => Some(Piece::Knight),
        2 => Some(Piece::Bishop),
        3 => Some(Piece::Rook),
        4 => Some(Piece::Queen),
        _ => None,
    };
    ChessMove::new(from, to, promo)
}

/// A playable game: the rule-library board plus the path-dependent state the
/// board alone does not carry (halfmove clock, repetition keys, ply count).
///
/// Scratch copies made with `snapshot` remember the ply they were taken at so
/// repetition handling can distinguish "strictly after the search root".
#[derive(Clone, Debug)]
pub struct Game {
    board: Board,
    ply: u32,
    rule50: u32,
    search_root_ply: u32,
    key_history: Vec<u64>,
    move_history: Vec<ChessMove>,
}

impl Game {
    pub fn startpos() -> Self {
        let board = Board::default();
        Self {
            key_history: vec![board.get_hash()],
            board,
            ply: 0,
            rule50: 0,
            search_root_ply: 0,
            move_history: Vec::new(),
        }
    }

    pub fn from_fen(fen: &str) -> Result<Self> {
        let board = Board::from_str(fen).map_err(|e| anyhow!("bad FEN {fen:?}: {e}"))?;
        // The board discards the halfmove clock; recover it from field 5.
        let rule50 = fen
            .split_whitespace()
            .nth(4)
            .and_then(|f| f.parse::<u32>().ok())
            .unwrap_or(0);
        Ok(Self {
            key_history: vec![board.get_hash()],
            board,
            ply: 0,
            rule50,
            search_root_ply: 0,
            move_history: Vec::new(),
        })
    }

    /// Copy for one MCTS descent. The copy's search root is pinned here.
    pub fn snapshot(&self) -> Self {
        let mut copy = self.clone();
        copy.search_root_ply = self.ply;
        copy
    }

    #[inline]
    pub fn board(&self) -> &Board {
        &self.board
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    #[inline]
    pub fn ply(&self) -> u32 {
        self.ply
    }

    #[inline]
    pub fn ply_to_search_root(&self) -> u32 {
        self.ply - self.search_root_ply
    }

    #[inline]
    pub fn rule50_count(&self) -> u32 {
        self.rule50
    }

    /// Zobrist key of the current position (side to move, castling and
    /// en-passant rights included by the rule library).
    #[inline]
    pub fn key(&self) -> u64 {
        self.board.get_hash()
    }

    #[inline]
    pub fn in_check(&self) -> bool {
        self.board.checkers().popcnt() > 0
    }

    pub fn legal_moves(&self) -> Vec<ChessMove> {
        MoveGen::new_legal(&self.board).collect()
    }

    pub fn is_checkmate(&self) -> bool {
        self.board.status() == BoardStatus::Checkmate
    }

    pub fn apply_move(&mut self, mv: ChessMove) {
        let is_pawn = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        let is_capture = self.board.piece_on(mv.get_dest()).is_some()
            || (is_pawn && mv.get_source().get_file() != mv.get_dest().get_file());
        self.board = self.board.make_move_new(mv);
        self.rule50 = if is_pawn || is_capture { 0 } else { self.rule50 + 1 };
        self.ply += 1;
        self.key_history.push(self.board.get_hash());
        self.move_history.push(mv);
    }

    pub fn move_history(&self) -> &[ChessMove] {
        &self.move_history
    }

    /// Occurrences of the current position key earlier in the game, limited to
    /// the reversible tail, plus the ply distance back to the most recent one.
    pub fn repetition_info(&self) -> (u32, u32) {
        let current = *self.key_history.last().unwrap();
        let mut count = 0u32;
        let mut last_distance = 0u32;
        let limit = self.rule50 as usize;
        let len = self.key_history.len();
        for back in 1..=limit.min(len - 1) {
            if self.key_history[len - 1 - back] == current {
                count += 1;
                if last_distance == 0 {
                    last_distance = back as u32;
                }
            }
        }
        (count, last_distance)
    }

    pub fn is_rule50_draw(&self) -> bool {
        self.rule50 > 99
    }

    /// Draw by repetition seen from the search: threefold anywhere, or a
    /// single repeat whose earlier occurrence lies strictly after the root.
    /// The second case must not be stored on the node (the repeat can vanish
    /// once the root advances).
    pub fn repetition_draw(&self) -> RepetitionDraw {
        let (count, last_distance) = self.repetition_info();
        if count >= 2 {
            RepetitionDraw::Threefold
        } else if count == 1 && last_distance < self.ply_to_search_root() {
            RepetitionDraw::TwofoldAfterRoot
        } else {
            RepetitionDraw::None
        }
    }

    #[inline]
    pub fn piece_count(&self) -> u32 {
        self.board.combined().popcnt()
    }

    /// Non-pawn, non-king material in minor/rook/queen points, both sides.
    pub fn material(&self) -> u32 {
        let b = &self.board;
        3 * b.pieces(Piece::Knight).popcnt()
            + 3 * b.pieces(Piece::Bishop).popcnt()
            + 5 * b.pieces(Piece::Rook).popcnt()
            + 9 * b.pieces(Piece::Queen).popcnt()
    }

    /// 0.0 at full material, approaching 1.0 as material drains below
    /// `endgame_material_max`. Drives the progress value decay.
    pub fn endgame_proportion(&self, endgame_material_max: u32) -> f32 {
        if endgame_material_max == 0 {
            return 0.0;
        }
        (1.0 - self.material() as f32 / endgame_material_max as f32).clamp(0.0, 1.0)
    }

    pub fn parse_uci_move(&self, text: &str) -> Result<ChessMove> {
        let mv = ChessMove::from_str(text).map_err(|_| anyhow!("bad move {text:?}"))?;
        let legal = MoveGen::new_legal(&self.board).any(|m| m == mv);
        if !legal {
            return Err(anyhow!("illegal move {text:?}"));
        }
        Ok(mv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepetitionDraw {
    None,
    /// Draw; may be stored as a terminal value.
    Threefold,
    /// Draw for this descent only; never stored.
    TwofoldAfterRoot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_encoding_round_trips() {
        let game = Game::startpos();
        for mv in game.legal_moves() {
            assert_eq!(decode_move(encode_move(mv)), mv);
        }
        let promo = ChessMove::new(
            chess::Square::from_str("e7").unwrap(),
            chess::Square::from_str("e8").unwrap(),
            Some(Piece::Queen),
        );
        assert_eq!(decode_move(encode_move(promo)), promo);
    }

    #[test]
    fn rule50_resets_on_pawn_move_and_capture() {
        let mut game = Game::startpos();
        game.apply_move(game.parse_uci_move("g1f3").unwrap());
        assert_eq!(game.rule50_count(), 1);
        game.apply_move(game.parse_uci_move("e7e5").unwrap());
        assert_eq!(game.rule50_count(), 0);
        game.apply_move(game.parse_uci_move("f3e5").unwrap());
        assert_eq!(game.rule50_count(), 0);
    }

    #[test]
    fn threefold_detected_via_knight_shuffle() {
        let mut game = Game::startpos();
        for uci in [
            "g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8",
        ] {
            game.apply_move(game.parse_uci_move(uci).unwrap());
        }
        let (count, _) = game.repetition_info();
        assert!(count >= 2, "startpos should have repeated twice");
    }

    #[test]
    fn twofold_after_root_is_search_local() {
        let game = Game::startpos();
        // The knight-shuffle position at ply 2 recurs at ply 6, both strictly
        // inside the search path.
        let mut scratch = game.snapshot();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6"] {
            scratch.apply_move(scratch.parse_uci_move(uci).unwrap());
        }
        assert_eq!(scratch.repetition_draw(), RepetitionDraw::TwofoldAfterRoot);
    }

    #[test]
    fn repeat_of_the_root_itself_is_not_search_local() {
        let mut game = Game::startpos();
        for uci in ["g1f3", "g8f6"] {
            game.apply_move(game.parse_uci_move(uci).unwrap());
        }
        // The only earlier occurrence is the root; a draw here would evaporate
        // as soon as the root advances past it.
        let mut scratch = game.snapshot();
        for uci in ["f3g1", "f6g8", "g1f3", "g8f6"] {
            scratch.apply_move(scratch.parse_uci_move(uci).unwrap());
        }
        assert_eq!(scratch.repetition_draw(), RepetitionDraw::None);
    }

    #[test]
    fn fen_halfmove_clock_recovered() {
        let game = Game::from_fen("8/8/4k3/8/4K3/4B3/4N3/8 w - - 80 120").unwrap();
        assert_eq!(game.rule50_count(), 80);
        assert_eq!(game.piece_count(), 4);
    }
}
