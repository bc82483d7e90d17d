//! Chess domain utilities: PGN handling, score conversion, opening
//! classification, phase heuristics, and tactical pattern detection.

pub mod eco;
pub mod pgn;
pub mod phase;
pub mod score;
pub mod tactics;

pub use eco::{classify_opening, eco_database, EcoDatabase, EcoEntry};
pub use pgn::{compute_game_id, normalize_pgn, parse_game, parse_games, ParsedGame};
pub use phase::{classify_phase, GamePhase};
pub use score::{EngineScore, PovEval};
pub use tactics::{classify_blunder_tactics, BlunderTactics, TacticalPattern};
