//! Tactical pattern detection step.
//!
//! Runs over the classified moves and explains each blunder by the motif
//! the best move exploited or the weakness the blunder created. Already
//! persisted move rows are updated in place; the result data carries the
//! same classifications for a later `write`.

use async_trait::async_trait;
use shakmaty::uci::UciMove;
use tracing::debug;

use crate::chess::tactics::classify_blunder_tactics;
use crate::error::Result;
use crate::pipeline::context::{
    BlunderTactic, MoveClass, ScoredMove, StepContext, StepData, StepResult,
};
use crate::pipeline::AnalysisStep;

pub struct TacticsStep;

#[async_trait]
impl AnalysisStep for TacticsStep {
    fn step_id(&self) -> &'static str {
        "tactics"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["move_quality"]
    }

    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let moves: Vec<ScoredMove> = match ctx.step_result("move_quality").map(|r| &r.data) {
            Some(StepData::Moves(moves)) => moves.clone(),
            _ => Vec::new(),
        };

        let positions = ctx.game.positions_before();
        let mut tactics = Vec::new();

        for (index, scored) in moves.iter().enumerate() {
            if scored.classification != MoveClass::Blunder {
                continue;
            }
            let (board_before, played) = match positions.get(index) {
                Some(entry) => entry,
                None => break,
            };

            let best_move = scored
                .best_move_uci
                .as_deref()
                .and_then(|uci| UciMove::from_ascii(uci.as_bytes()).ok())
                .and_then(|uci| uci.to_move(board_before).ok());

            let result =
                classify_blunder_tactics(board_before, played, best_move.as_ref(), None);
            tactics.push(BlunderTactic {
                ply: scored.ply,
                pattern: result.primary_pattern(),
                pattern_name: result.primary_pattern_name(),
                reason: result.blunder_reason,
            });
        }

        // Update rows that already exist; a no-op when `write` has not
        // persisted this game yet (the write step re-applies the data).
        if !tactics.is_empty() {
            let updates: Vec<_> = tactics
                .iter()
                .map(|t| (t.pattern, t.reason.clone(), ctx.game_id.clone(), t.ply))
                .collect();
            ctx.analysis.update_move_tactics(&updates)?;
            debug!(
                "classified {} blunders for game {}",
                tactics.len(),
                ctx.game_id
            );
        }

        Ok(StepResult::ok(self.step_id(), StepData::Tactics(tactics)))
    }
}

#[cfg(test)]
mod tests {
    use shakmaty::Color;

    use super::*;
    use crate::chess::score::{EngineScore, PovEval};
    use crate::chess::tactics::TacticalPattern;
    use crate::db::games::{GameStore, NewGame};
    use crate::db::{AnalysisStore, Database};
    use crate::pipeline::context::MoveEval;
    use crate::pipeline::steps::MoveQualityStep;

    const HANGING_QUEEN_PGN: &str = "1. e4 e5 2. Nf3 Qh4 3. Nxh4 *\n";

    fn scored(ply: u32, player: Color, uci: &str, class: MoveClass) -> ScoredMove {
        ScoredMove {
            ply,
            move_number: (ply + 1) / 2,
            player,
            uci: uci.to_string(),
            san: None,
            eval_before: 0,
            eval_after: if class == MoveClass::Blunder { -400 } else { 0 },
            delta: 0,
            cp_loss: if class == MoveClass::Blunder { 400 } else { 0 },
            classification: class,
            best_move_uci: None,
            best_move_san: None,
            best_line: None,
            best_move_eval: None,
            game_phase: None,
            difficulty: None,
        }
    }

    #[tokio::test]
    async fn blunder_gets_tactical_pattern() {
        let db = Database::open_in_memory().unwrap();
        let analysis = AnalysisStore::new(db.clone());
        let games = GameStore::new(db);
        let game = NewGame::from_pgn(HANGING_QUEEN_PGN, "lichess", "alice").unwrap();
        let game_id = game.game_id.clone();
        games.insert_games(&[game]).unwrap();
        let parsed = games.load_game(&game_id).unwrap();

        let mut ctx = StepContext::new(
            game_id,
            parsed,
            &analysis,
            &games,
            "stockfish".to_string(),
            Default::default(),
            Some(10),
            None,
            false,
            None,
        );
        ctx.add_step_result(StepResult::ok(
            "move_quality",
            StepData::Moves(vec![
                scored(1, Color::White, "e2e4", MoveClass::Good),
                scored(2, Color::Black, "e7e5", MoveClass::Good),
                scored(3, Color::White, "g1f3", MoveClass::Good),
                scored(4, Color::Black, "d8h4", MoveClass::Blunder),
                scored(5, Color::White, "f3h4", MoveClass::Good),
            ]),
        ));

        let result = TacticsStep.execute(&mut ctx).await.unwrap();
        match result.data {
            StepData::Tactics(tactics) => {
                assert_eq!(tactics.len(), 1);
                assert_eq!(tactics[0].ply, 4);
                assert_eq!(tactics[0].pattern, TacticalPattern::HangingPiece);
                assert!(tactics[0].reason.to_lowercase().contains("hanging queen"));
            }
            other => panic!("unexpected data: {:?}", other),
        }
    }

    #[tokio::test]
    async fn hanging_queen_end_to_end_from_evaluations() {
        // Drive move_quality then tactics from synthetic engine data, the
        // way the executor chains them.
        let db = Database::open_in_memory().unwrap();
        let analysis = AnalysisStore::new(db.clone());
        let games = GameStore::new(db);
        let game = NewGame::from_pgn(HANGING_QUEEN_PGN, "lichess", "alice").unwrap();
        let game_id = game.game_id.clone();
        games.insert_games(&[game]).unwrap();
        let parsed = games.load_game(&game_id).unwrap();

        let positions = parsed.positions_before();
        let evals: Vec<MoveEval> = [
            (1u32, Color::White, "e2e4", "e4", 30, 25),
            (2, Color::Black, "e7e5", "e5", -25, -30),
            (3, Color::White, "g1f3", "Nf3", 30, 28),
            // Qh4 hangs the queen: from black's view the eval collapses.
            (4, Color::Black, "d8h4", "Qh4", -28, -870),
            (5, Color::White, "f3h4", "Nxh4", 870, 860),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (ply, player, uci, san, before, after))| MoveEval {
            ply,
            move_number: (ply + 1) / 2,
            player,
            uci: uci.to_string(),
            san: san.to_string(),
            eval_before: before,
            eval_after: after,
            score_before: PovEval::new(EngineScore::Cp(before), player),
            best_move_uci: if ply == 4 {
                Some("g8f6".to_string())
            } else {
                None
            },
            best_move_san: if ply == 4 { Some("Nf6".to_string()) } else { None },
            best_line: None,
            best_move_eval: Some(before),
            position: positions[i].0.clone(),
        })
        .collect();

        let mut ctx = StepContext::new(
            game_id,
            parsed,
            &analysis,
            &games,
            "stockfish".to_string(),
            Default::default(),
            Some(10),
            None,
            false,
            None,
        );
        ctx.add_step_result(StepResult::ok("stockfish", StepData::Evaluations(evals)));

        let quality = MoveQualityStep.execute(&mut ctx).await.unwrap();
        match &quality.data {
            StepData::Moves(moves) => {
                let qh4 = &moves[3];
                assert_eq!(qh4.classification, MoveClass::Blunder);
                assert!(qh4.cp_loss >= 200);
                assert_eq!(qh4.best_move_uci.as_deref(), Some("g8f6"));
            }
            other => panic!("unexpected data: {:?}", other),
        }
        ctx.add_step_result(quality);

        let result = TacticsStep.execute(&mut ctx).await.unwrap();
        match result.data {
            StepData::Tactics(tactics) => {
                assert_eq!(tactics.len(), 1);
                assert_ne!(tactics[0].pattern, TacticalPattern::None);
            }
            other => panic!("unexpected data: {:?}", other),
        }
    }
}
