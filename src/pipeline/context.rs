//! Per-run pipeline state shared between steps.

use std::collections::HashMap;

use shakmaty::{Chess, Color};

use crate::chess::pgn::ParsedGame;
use crate::chess::phase::GamePhase;
use crate::chess::score::PovEval;
use crate::chess::tactics::TacticalPattern;
use crate::config::{SearchLimit, Thresholds};
use crate::db::analysis::AnalysisStore;
use crate::db::games::GameStore;
use crate::engine::EngineProcess;

/// Move quality classes, ordered worst-last. Stored by discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MoveClass {
    Good = 0,
    Inaccuracy = 1,
    Mistake = 2,
    Blunder = 3,
}

impl MoveClass {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(MoveClass::Good),
            1 => Some(MoveClass::Inaccuracy),
            2 => Some(MoveClass::Mistake),
            3 => Some(MoveClass::Blunder),
            _ => None,
        }
    }
}

/// Raw engine output for one played move, produced by the `stockfish` step.
#[derive(Debug, Clone)]
pub struct MoveEval {
    pub ply: u32,
    pub move_number: u32,
    pub player: Color,
    pub uci: String,
    pub san: String,
    /// Mover-perspective centipawns before the move.
    pub eval_before: i32,
    /// Mover-perspective centipawns after the move (mate sentinel when the
    /// move delivered checkmate).
    pub eval_after: i32,
    /// Engine score of the pre-move position, with its point of view.
    pub score_before: PovEval,
    pub best_move_uci: Option<String>,
    pub best_move_san: Option<String>,
    /// First few principal-variation moves, SAN-joined.
    pub best_line: Option<String>,
    pub best_move_eval: Option<i32>,
    /// Board before the move; difficulty and tactics work from this.
    pub position: Chess,
}

/// A fully classified move, ready to persist.
#[derive(Debug, Clone)]
pub struct ScoredMove {
    pub ply: u32,
    pub move_number: u32,
    pub player: Color,
    pub uci: String,
    pub san: Option<String>,
    pub eval_before: i32,
    pub eval_after: i32,
    pub delta: i32,
    pub cp_loss: i32,
    pub classification: MoveClass,
    pub best_move_uci: Option<String>,
    pub best_move_san: Option<String>,
    pub best_line: Option<String>,
    pub best_move_eval: Option<i32>,
    pub game_phase: Option<GamePhase>,
    pub difficulty: Option<u8>,
}

/// Per-ply phase classification from the `phase` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEntry {
    pub ply: u32,
    pub move_number: u32,
    pub phase: GamePhase,
}

/// Tactical classification of one blunder, from the `tactics` step.
#[derive(Debug, Clone)]
pub struct BlunderTactic {
    pub ply: u32,
    pub pattern: TacticalPattern,
    pub pattern_name: &'static str,
    pub reason: String,
}

/// Typed payload of a step result. Downstream steps match on the variant
/// they consume; a skipped step leaves `Empty` behind.
#[derive(Debug, Clone, Default)]
pub enum StepData {
    #[default]
    Empty,
    Eco {
        code: Option<String>,
        name: Option<String>,
    },
    Evaluations(Vec<MoveEval>),
    Moves(Vec<ScoredMove>),
    Phases(Vec<PhaseEntry>),
    Tactics(Vec<BlunderTactic>),
    Written {
        moves: usize,
    },
}

/// Outcome of one step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub data: StepData,
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(step_id: &str, data: StepData) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(step_id: &str, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: false,
            data: StepData::Empty,
            error: Some(error.into()),
        }
    }
}

/// Everything a step needs for one game. Lives exactly one pipeline run
/// and is never shared across games.
pub struct StepContext<'a> {
    pub game_id: String,
    pub game: ParsedGame,
    pub analysis: &'a AnalysisStore,
    pub games: &'a GameStore,
    pub engine_path: String,
    pub thresholds: Thresholds,
    pub limit: SearchLimit,
    pub depth: Option<u32>,
    pub time_limit: Option<f64>,
    pub force_rerun: bool,
    /// Engine borrowed from the pool, if the run is pooled. Steps that
    /// need an engine spawn their own when this is `None`.
    pub engine: Option<&'a mut EngineProcess>,
    step_results: HashMap<String, StepResult>,
}

impl<'a> StepContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        game_id: String,
        game: ParsedGame,
        analysis: &'a AnalysisStore,
        games: &'a GameStore,
        engine_path: String,
        thresholds: Thresholds,
        depth: Option<u32>,
        time_limit: Option<f64>,
        force_rerun: bool,
        engine: Option<&'a mut EngineProcess>,
    ) -> Self {
        Self {
            game_id,
            game,
            analysis,
            games,
            engine_path,
            thresholds,
            limit: SearchLimit::from_budget(depth, time_limit),
            depth,
            time_limit,
            force_rerun,
            engine,
            step_results: HashMap::new(),
        }
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn add_step_result(&mut self, result: StepResult) {
        self.step_results.insert(result.step_id.clone(), result);
    }

    pub fn has_successful_result(&self, step_id: &str) -> bool {
        self.step_results
            .get(step_id)
            .map_or(false, |result| result.success)
    }
}
