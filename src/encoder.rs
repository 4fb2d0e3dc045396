use chess::{Board, ChessMove, Color, Piece, ALL_SQUARES};

pub const INPUT_PLANES: usize = 18;
pub const INPUT_SIZE: usize = INPUT_PLANES * 64;

/// 56 sliding planes (8 directions x 7 distances) + 8 knight planes +
/// 9 underpromotion planes (3 directions x knight/bishop/rook). Queen
/// promotions use the ordinary sliding plane for their direction.
pub const POLICY_PLANES: usize = 73;
pub const POLICY_SIZE: usize = POLICY_PLANES * 64;

/// One position's worth of network input, flattened plane-major.
pub type InputPlanes = [f32; INPUT_SIZE];

pub const PRIOR_QUANTUM_ONE: u16 = u16::MAX;

/// Map a probability in (0, 1] onto [1, 65535]; zero never round-trips so a
/// stored prior can always be distinguished from an empty slot.
#[inline]
pub fn quantize_probability(p: f32) -> u16 {
    ((p * PRIOR_QUANTUM_ONE as f32).round() as i64).clamp(1, PRIOR_QUANTUM_ONE as i64) as u16
}

#[inline]
pub fn dequantize_probability(q: u16) -> f32 {
    q as f32 / PRIOR_QUANTUM_ONE as f32
}

#[inline]
fn piece_plane(piece: Piece, color: Color) -> usize {
    let base = match piece {
        Piece::Pawn => 0,
        Piece::Knight => 2,
        Piece::Bishop => 4,
        Piece::Rook => 6,
        Piece::Queen => 8,
        Piece::King => 10,
    };
    base + usize::from(color == Color::Black)
}

/// Encode a position as the network's input planes: 12 piece planes,
/// 4 castling planes, side to move, and the scaled no-progress counter.
pub fn encode_position(board: &Board, rule50: u32) -> InputPlanes {
    let mut planes = [0f32; INPUT_SIZE];

    for square in ALL_SQUARES.iter() {
        if let Some(piece) = board.piece_on(*square) {
            let color = board.color_on(*square).unwrap();
            planes[piece_plane(piece, color) * 64 + square.to_index()] = 1.0;
        }
    }

    let mut fill = |plane: usize, on: bool| {
        if on {
            planes[plane * 64..(plane + 1) * 64].fill(1.0);
        }
    };
    let white = board.castle_rights(Color::White);
    let black = board.castle_rights(Color::Black);
    fill(12, white.has_kingside());
    fill(13, white.has_queenside());
    fill(14, black.has_kingside());
    fill(15, black.has_queenside());
    fill(16, board.side_to_move() == Color::White);

    let progress = (rule50 as f32 / 100.0).min(1.0);
    planes[17 * 64..18 * 64].fill(progress);

    planes
}

/// Index of a move in the policy tensor. Keyed by source square and a
/// direction/distance plane; board orientation is absolute for both colors.
pub fn move_to_policy_index(mv: ChessMove) -> usize {
    let from = mv.get_source();
    let to = mv.get_dest();
    let dr = to.get_rank().to_index() as i32 - from.get_rank().to_index() as i32;
    let df = to.get_file().to_index() as i32 - from.get_file().to_index() as i32;

    let plane = match mv.get_promotion() {
        Some(promo) if promo != Piece::Queen => {
            // Underpromotions: file step in {-1, 0, 1}.
            let dir = (df + 1) as usize;
            let piece = match promo {
                Piece::Knight => 0,
                Piece::Bishop => 1,
                _ => 2,
            };
            64 + dir * 3 + piece
        }
        _ => {
            if (dr.abs() == 2 && df.abs() == 1) || (dr.abs() == 1 && df.abs() == 2) {
                // Knight planes 56..64, indexed by octant.
                let octant = match (dr, df) {
                    (2, 1) => 0,
                    (1, 2) => 1,
                    (-1, 2) => 2,
                    (-2, 1) => 3,
                    (-2, -1) => 4,
                    (-1, -2) => 5,
                    (1, -2) => 6,
                    _ => 7,
                };
                56 + octant
            } else {
                // Sliding planes 0..56: direction index x 7 + (distance - 1).
                let dir = match (dr.signum(), df.signum()) {
                    (1, 0) => 0,
                    (1, 1) => 1,
                    (0, 1) => 2,
                    (-1, 1) => 3,
                    (-1, 0) => 4,
                    (-1, -1) => 5,
                    (0, -1) => 6,
                    _ => 7,
                };
                let distance = dr.abs().max(df.abs()) as usize;
                dir * 7 + (distance - 1)
            }
        }
    };

    plane * 64 + from.to_index()
}

/// Gather each legal move's logit out of the policy tensor.
pub fn gather_logits(policy: &[f32], moves: &[ChessMove], out: &mut Vec<f32>) {
    out.clear();
    for &mv in moves {
        out.push(policy[move_to_policy_index(mv)]);
    }
}

/// In-place softmax, numerically stable against large logits.
pub fn softmax(distribution: &mut [f32]) {
    if distribution.is_empty() {
        return;
    }
    let max = distribution.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0f32;
    for v in distribution.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 && sum.is_finite() {
        for v in distribution.iter_mut() {
            *v /= sum;
        }
    } else {
        let uniform = 1.0 / distribution.len() as f32;
        distribution.fill(uniform);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::MoveGen;
    use std::str::FromStr;

    #[test]
    fn quantization_round_trips_one() {
        assert_eq!(quantize_probability(1.0), PRIOR_QUANTUM_ONE);
        assert_eq!(dequantize_probability(PRIOR_QUANTUM_ONE), 1.0);
        assert_eq!(quantize_probability(0.0), 1, "no-zero quantization");
    }

    #[test]
    fn quantization_error_within_one_quantum() {
        for p in [0.001f32, 0.25, 0.5, 0.73, 0.999] {
            let back = dequantize_probability(quantize_probability(p));
            assert!((back - p).abs() <= 1.5 / PRIOR_QUANTUM_ONE as f32);
        }
    }

    #[test]
    fn policy_indices_unique_per_position() {
        let board = Board::default();
        let mut seen = std::collections::HashSet::new();
        for mv in MoveGen::new_legal(&board) {
            let idx = move_to_policy_index(mv);
            assert!(idx < POLICY_SIZE);
            assert!(seen.insert(idx), "duplicate policy index for {mv}");
        }
    }

    #[test]
    fn underpromotions_distinct_from_queen_promotion() {
        let board = Board::from_str("4k3/1P6/8/8/8/8/8/4K3 w - - 0 1").unwrap();
        let mut seen = std::collections::HashSet::new();
        for mv in MoveGen::new_legal(&board) {
            assert!(seen.insert(move_to_policy_index(mv)));
        }
    }

    #[test]
    fn softmax_normalizes() {
        let mut d = vec![1.0f32, 2.0, 3.0];
        softmax(&mut d);
        let sum: f32 = d.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(d[2] > d[1] && d[1] > d[0]);
    }

    #[test]
    fn encode_startpos_planes() {
        let planes = encode_position(&Board::default(), 0);
        let piece_sum: f32 = planes[..12 * 64].iter().sum();
        assert_eq!(piece_sum, 32.0);
        assert_eq!(planes[16 * 64], 1.0);
        assert_eq!(planes[17 * 64], 0.0);
    }
}
