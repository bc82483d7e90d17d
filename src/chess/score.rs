//! Engine score handling.
//!
//! UCI engines report scores from the side to move. Analysis wants them from
//! a fixed player's perspective, with forced mates collapsed to a large
//! sentinel so they dominate any material evaluation.

use shakmaty::Color;

use crate::config::MATE_SCORE;

/// Raw engine score, from the perspective of the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineScore {
    /// Centipawns.
    Cp(i32),
    /// Moves until forced mate; positive means the side to move mates.
    Mate(i32),
}

impl Default for EngineScore {
    fn default() -> Self {
        EngineScore::Cp(0)
    }
}

/// An engine score together with the side it was reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PovEval {
    pub score: EngineScore,
    /// Side to move in the position the engine analysed.
    pub pov: Color,
}

impl PovEval {
    pub fn new(score: EngineScore, pov: Color) -> Self {
        Self { score, pov }
    }

    /// Centipawn value from `side`'s perspective, mate collapsed to the
    /// `MATE_SCORE` sentinel.
    pub fn cp(&self, side: Color) -> i32 {
        let value = match self.score {
            EngineScore::Cp(cp) => cp,
            EngineScore::Mate(moves) if moves > 0 => MATE_SCORE,
            EngineScore::Mate(_) => -MATE_SCORE,
        };
        if side == self.pov {
            value
        } else {
            -value
        }
    }

    /// Whether the score is a forced mate for either side.
    pub fn is_mate(&self) -> bool {
        matches!(self.score, EngineScore::Mate(_))
    }
}

/// Format a centipawn evaluation from a player's perspective, e.g. `+1.5`.
pub fn format_eval(cp: i32, player: Color) -> String {
    let cp = if player == Color::Black { -cp } else { cp };
    if cp >= 10_000 {
        return "+M".to_string();
    }
    if cp <= -10_000 {
        return "-M".to_string();
    }
    let sign = if cp > 0 { "+" } else { "" };
    format!("{}{:.1}", sign, f64::from(cp) / 100.0)
}
