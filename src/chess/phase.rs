//! Game-phase classification.

use serde::{Deserialize, Serialize};
use shakmaty::{Chess, Position};

/// Broad phase of a chess game, keyed on material and move number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GamePhase {
    Opening,
    Middlegame,
    Endgame,
}

impl GamePhase {
    pub fn as_i64(self) -> i64 {
        match self {
            GamePhase::Opening => 0,
            GamePhase::Middlegame => 1,
            GamePhase::Endgame => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(GamePhase::Opening),
            1 => Some(GamePhase::Middlegame),
            2 => Some(GamePhase::Endgame),
            _ => None,
        }
    }
}

/// Classify the phase of a position at a given fullmove number.
///
/// Piece count excludes the two kings.
pub fn classify_phase(pos: &Chess, move_number: u32) -> GamePhase {
    let piece_count = pos.board().occupied().count().saturating_sub(2) as u32;

    if move_number <= 10 && piece_count >= 20 {
        return GamePhase::Opening;
    }
    if move_number <= 15 && piece_count >= 16 {
        return GamePhase::Opening;
    }
    if piece_count <= 6 {
        return GamePhase::Endgame;
    }
    if piece_count <= 10 && move_number > 30 {
        return GamePhase::Endgame;
    }
    GamePhase::Middlegame
}
