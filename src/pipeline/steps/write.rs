//! Persistence step.
//!
//! Merges the phase classifications into the scored moves, then commits
//! the analysis record and all move rows in one transaction. This is the
//! durable side effect the whole pipeline exists for; the executor only
//! marks the step completed after it returns success.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;

use crate::chess::phase::GamePhase;
use crate::db::analysis::AnalysisRecord;
use crate::error::Result;
use crate::pipeline::context::{ScoredMove, StepContext, StepData, StepResult};
use crate::pipeline::AnalysisStep;

pub struct WriteStep;

#[async_trait]
impl AnalysisStep for WriteStep {
    fn step_id(&self) -> &'static str {
        "write"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["eco", "move_quality", "phase"]
    }

    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        // `None` means move_quality was skipped in this run, i.e. the rows
        // from the prior run are still intact and must not be wiped.
        let fresh_moves: Option<Vec<ScoredMove>> =
            match ctx.step_result("move_quality").map(|r| &r.data) {
                Some(StepData::Moves(moves)) => Some(moves.clone()),
                _ => None,
            };

        let phases: HashMap<u32, GamePhase> = match ctx.step_result("phase").map(|r| &r.data) {
            Some(StepData::Phases(entries)) => {
                entries.iter().map(|p| (p.ply, p.phase)).collect()
            }
            _ => HashMap::new(),
        };

        // A skipped eco step synthesizes an empty result; fall back to the
        // opening already persisted so a resumed run does not erase it.
        let (eco_code, eco_name) = match ctx.step_result("eco").map(|r| &r.data) {
            Some(StepData::Eco { code, name }) => (code.clone(), name.clone()),
            _ => match ctx.analysis.get_analysis(&ctx.game_id)? {
                Some(existing) => (existing.eco_code, existing.eco_name),
                None => (None, None),
            },
        };

        let record = AnalysisRecord {
            game_id: ctx.game_id.clone(),
            pgn_path: String::new(),
            analyzed_at: Utc::now().to_rfc3339(),
            engine_path: ctx.engine_path.clone(),
            depth: ctx.depth,
            time_limit: ctx.time_limit,
            thresholds: ctx.thresholds,
            eco_code,
            eco_name,
        };

        let moves = match fresh_moves {
            Some(mut moves) => {
                for m in &mut moves {
                    m.game_phase = phases.get(&m.ply).copied();
                }
                ctx.analysis.write_analysis(&record, &moves)?;
                moves
            }
            None => {
                ctx.analysis.write_record(&record)?;
                Vec::new()
            }
        };

        // Tactics computed earlier in this run would be lost by the row
        // replacement above; re-apply them.
        if let Some(StepData::Tactics(tactics)) =
            ctx.step_result("tactics").filter(|r| r.success).map(|r| &r.data)
        {
            if !tactics.is_empty() {
                let updates: Vec<_> = tactics
                    .iter()
                    .map(|t| (t.pattern, t.reason.clone(), ctx.game_id.clone(), t.ply))
                    .collect();
                ctx.analysis.update_move_tactics(&updates)?;
            }
        }

        ctx.games.mark_game_analyzed(&ctx.game_id)?;

        Ok(StepResult::ok(
            self.step_id(),
            StepData::Written { moves: moves.len() },
        ))
    }
}

#[cfg(test)]
mod tests {
    use shakmaty::Color;

    use super::*;
    use crate::chess::tactics::TacticalPattern;
    use crate::config::Thresholds;
    use crate::db::games::{GameStore, NewGame};
    use crate::db::{AnalysisStore, Database};
    use crate::pipeline::context::{BlunderTactic, MoveClass, PhaseEntry};

    const PGN: &str = "1. e4 e5 2. Nf3 Nc6 *\n";

    fn scored(ply: u32) -> ScoredMove {
        ScoredMove {
            ply,
            move_number: (ply + 1) / 2,
            player: if ply % 2 == 1 { Color::White } else { Color::Black },
            uci: "e2e4".to_string(),
            san: Some("e4".to_string()),
            eval_before: 20,
            eval_after: 10,
            delta: 10,
            cp_loss: 10,
            classification: MoveClass::Good,
            best_move_uci: None,
            best_move_san: None,
            best_line: None,
            best_move_eval: None,
            game_phase: None,
            difficulty: Some(0),
        }
    }

    struct Fixture {
        analysis: AnalysisStore,
        games: GameStore,
        game_id: String,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let analysis = AnalysisStore::new(db.clone());
        let games = GameStore::new(db);
        let game = NewGame::from_pgn(PGN, "lichess", "alice").unwrap();
        let game_id = game.game_id.clone();
        games.insert_games(&[game]).unwrap();
        Fixture {
            analysis,
            games,
            game_id,
        }
    }

    fn context<'a>(fx: &'a Fixture) -> StepContext<'a> {
        let parsed = fx.games.load_game(&fx.game_id).unwrap();
        StepContext::new(
            fx.game_id.clone(),
            parsed,
            &fx.analysis,
            &fx.games,
            "/usr/bin/stockfish".to_string(),
            Thresholds::default(),
            Some(14),
            None,
            false,
            None,
        )
    }

    #[tokio::test]
    async fn writes_record_moves_and_phases() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.add_step_result(StepResult::ok(
            "eco",
            StepData::Eco {
                code: Some("C44".to_string()),
                name: Some("King's Pawn Game".to_string()),
            },
        ));
        ctx.add_step_result(StepResult::ok(
            "move_quality",
            StepData::Moves(vec![scored(1), scored(2), scored(3), scored(4)]),
        ));
        ctx.add_step_result(StepResult::ok(
            "phase",
            StepData::Phases(
                (1..=4)
                    .map(|ply| PhaseEntry {
                        ply,
                        move_number: (ply + 1) / 2,
                        phase: crate::chess::phase::GamePhase::Opening,
                    })
                    .collect(),
            ),
        ));

        let result = WriteStep.execute(&mut ctx).await.unwrap();
        assert!(result.success);
        match result.data {
            StepData::Written { moves } => assert_eq!(moves, 4),
            other => panic!("unexpected data: {:?}", other),
        }

        let record = fx.analysis.get_analysis(&fx.game_id).unwrap().unwrap();
        assert_eq!(record.eco_code.as_deref(), Some("C44"));
        assert_eq!(record.depth, Some(14));
        assert_eq!(record.engine_path, "/usr/bin/stockfish");

        let rows = fx.analysis.fetch_moves(&fx.game_id).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows
            .iter()
            .all(|r| r.game_phase == Some(crate::chess::phase::GamePhase::Opening)));

        // The pipeline flips the game's analyzed flag here.
        assert!(fx.games.get_game(&fx.game_id).unwrap().unwrap().analyzed);
    }

    #[tokio::test]
    async fn tactics_from_same_run_survive_replacement() {
        let fx = fixture();
        let mut ctx = context(&fx);
        let mut blunder = scored(2);
        blunder.classification = MoveClass::Blunder;
        ctx.add_step_result(StepResult::ok(
            "eco",
            StepData::Eco { code: None, name: None },
        ));
        ctx.add_step_result(StepResult::ok(
            "move_quality",
            StepData::Moves(vec![scored(1), blunder]),
        ));
        ctx.add_step_result(StepResult::ok("phase", StepData::Phases(Vec::new())));
        ctx.add_step_result(StepResult::ok(
            "tactics",
            StepData::Tactics(vec![BlunderTactic {
                ply: 2,
                pattern: TacticalPattern::HangingPiece,
                pattern_name: TacticalPattern::HangingPiece.label(),
                reason: "Created hanging queen".to_string(),
            }]),
        ));

        WriteStep.execute(&mut ctx).await.unwrap();

        let rows = fx.analysis.fetch_moves(&fx.game_id).unwrap();
        let blunder_row = rows.iter().find(|r| r.ply == 2).unwrap();
        assert_eq!(blunder_row.tactical_pattern, Some(TacticalPattern::HangingPiece));
        assert_eq!(
            blunder_row.tactical_reason.as_deref(),
            Some("Created hanging queen")
        );
    }

    #[tokio::test]
    async fn empty_upstream_data_writes_empty_analysis() {
        // Resumption path: upstream steps were skipped with empty results.
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.add_step_result(StepResult::ok("eco", StepData::Empty));
        ctx.add_step_result(StepResult::ok("move_quality", StepData::Empty));
        ctx.add_step_result(StepResult::ok("phase", StepData::Empty));

        let result = WriteStep.execute(&mut ctx).await.unwrap();
        assert!(result.success);
        assert!(fx.analysis.analysis_exists(&fx.game_id).unwrap());
        assert_eq!(fx.analysis.count_moves(&fx.game_id).unwrap(), 0);
    }
}
