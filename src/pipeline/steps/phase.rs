//! Game-phase classification step.

use async_trait::async_trait;
use shakmaty::{Color, Position};

use crate::chess::phase::classify_phase;
use crate::error::Result;
use crate::pipeline::context::{PhaseEntry, StepContext, StepData, StepResult};
use crate::pipeline::AnalysisStep;

/// Classifies every ply as opening, middlegame, or endgame from the
/// position before the move.
pub struct PhaseStep;

#[async_trait]
impl AnalysisStep for PhaseStep {
    fn step_id(&self) -> &'static str {
        "phase"
    }

    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let mut phases = Vec::with_capacity(ctx.game.ply_count());

        for (board, _m) in ctx.game.positions_before() {
            let move_number = board.fullmoves().get();
            let ply = (move_number - 1) * 2 + if board.turn() == Color::White { 1 } else { 2 };
            phases.push(PhaseEntry {
                ply,
                move_number,
                phase: classify_phase(&board, move_number),
            });
        }

        Ok(StepResult::ok(self.step_id(), StepData::Phases(phases)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::pgn::parse_game;
    use crate::chess::phase::GamePhase;
    use crate::db::games::GameStore;
    use crate::db::{AnalysisStore, Database};

    #[tokio::test]
    async fn short_game_is_all_opening() {
        let db = Database::open_in_memory().unwrap();
        let analysis = AnalysisStore::new(db.clone());
        let games = GameStore::new(db);
        let parsed = parse_game("1. e4 e5 2. Qh5 Nc6 3. Bc4 Nf6 4. Qxf7# 1-0").unwrap();
        let mut ctx = StepContext::new(
            "g1".to_string(),
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

        let result = PhaseStep.execute(&mut ctx).await.unwrap();
        match result.data {
            StepData::Phases(phases) => {
                assert_eq!(phases.len(), 7);
                assert_eq!(phases[0], PhaseEntry { ply: 1, move_number: 1, phase: GamePhase::Opening });
                assert_eq!(phases[1].ply, 2);
                assert_eq!(phases[6], PhaseEntry { ply: 7, move_number: 4, phase: GamePhase::Opening });
                assert!(phases.iter().all(|p| p.phase == GamePhase::Opening));
            }
            other => panic!("unexpected data: {:?}", other),
        }
    }
}
