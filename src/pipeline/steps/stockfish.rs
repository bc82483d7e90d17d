//! Engine evaluation step.
//!
//! Evaluates every position of the game in one linear pass: the initial
//! board plus the board after each mainline move. Checkmate positions are
//! never sent to the engine; the mate sentinel stands in for them.

use std::path::Path;

use async_trait::async_trait;
use shakmaty::{san::SanPlus, uci::UciMove, CastlingMode, Chess, Color, Position};
use tracing::debug;

use crate::config::MATE_SCORE;
use crate::engine::process::{EngineProcess, PositionEval};
use crate::error::{Error, Result};
use crate::pipeline::context::{MoveEval, StepContext, StepData, StepResult};
use crate::pipeline::AnalysisStep;

/// How many principal-variation moves are rendered into `best_line`.
const BEST_LINE_PLIES: usize = 5;

/// Evaluates all positions of the game with a UCI engine. Uses the
/// context's borrowed engine when one is present, otherwise owns a
/// freshly spawned process for the duration of the step.
pub struct StockfishStep;

#[async_trait]
impl AnalysisStep for StockfishStep {
    fn step_id(&self) -> &'static str {
        "stockfish"
    }

    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let limit = ctx.limit;

        // Positions to evaluate plus per-move metadata, one linear pass.
        let mut pos = ctx.game.root();
        let mut positions: Vec<Chess> = vec![pos.clone()];
        let mut metadata: Vec<(u32, u32, Color, String, String)> = Vec::new();
        for m in ctx.game.mainline() {
            let player = pos.turn();
            let move_number = pos.fullmoves().get();
            let ply = (move_number - 1) * 2 + if player == Color::White { 1 } else { 2 };
            let uci = m.to_uci(CastlingMode::Standard).to_string();
            let san = SanPlus::from_move_and_play_unchecked(&mut pos, m).to_string();
            metadata.push((move_number, ply, player, uci, san));
            positions.push(pos.clone());
        }

        let mut owned: Option<EngineProcess> = None;
        let engine: &mut EngineProcess = match ctx.engine.as_deref_mut() {
            Some(engine) => engine,
            None => {
                debug!("no pooled engine in context, spawning one for {}", ctx.game_id);
                owned.get_or_insert(EngineProcess::new(Path::new(&ctx.engine_path)).await?)
            }
        };

        let mut infos: Vec<Option<PositionEval>> = Vec::with_capacity(positions.len());
        let mut analyse_error: Option<Error> = None;
        for position in &positions {
            if position.is_checkmate() {
                infos.push(None);
                continue;
            }
            match engine.analyse(position, limit).await {
                Ok(info) => infos.push(Some(info)),
                Err(e) => {
                    analyse_error = Some(e);
                    break;
                }
            }
        }

        // An owned engine is quit even when the evaluation pass failed.
        if let Some(mut engine) = owned {
            let _ = engine.quit().await;
        }
        if let Some(e) = analyse_error {
            return Err(e);
        }

        let mut move_evals = Vec::with_capacity(metadata.len());
        for (i, (move_number, ply, player, uci, san)) in metadata.into_iter().enumerate() {
            let info_before = infos[i].as_ref().ok_or_else(|| {
                Error::PipelineFailed("position before a played move has no evaluation".into())
            })?;
            let eval_before = info_before.eval.cp(player);
            let board = &positions[i];

            let (best_move_uci, best_move_san, best_line) = render_pv(board, &info_before.pv);
            let best_move_eval = best_move_uci.as_ref().map(|_| eval_before);

            let board_after = &positions[i + 1];
            let eval_after = if board_after.is_checkmate() {
                MATE_SCORE
            } else {
                infos[i + 1]
                    .as_ref()
                    .ok_or_else(|| {
                        Error::PipelineFailed("non-mate position has no evaluation".into())
                    })?
                    .eval
                    .cp(player)
            };

            move_evals.push(MoveEval {
                ply,
                move_number,
                player,
                uci,
                san,
                eval_before,
                eval_after,
                score_before: info_before.eval,
                best_move_uci,
                best_move_san,
                best_line,
                best_move_eval,
                position: board.clone(),
            });
        }

        Ok(StepResult::ok(
            self.step_id(),
            StepData::Evaluations(move_evals),
        ))
    }
}

/// Render the engine's principal variation against the position.
///
/// Engines occasionally emit a PV that is stale for the position we
/// associate it with; rendering stops at the first illegal move, and a PV
/// whose very first move is illegal yields no best move at all.
fn render_pv(board: &Chess, pv: &[String]) -> (Option<String>, Option<String>, Option<String>) {
    let first = match pv.first() {
        Some(first) => first,
        None => return (None, None, None),
    };
    let first_move = match UciMove::from_ascii(first.as_bytes())
        .ok()
        .and_then(|uci| uci.to_move(board).ok())
    {
        Some(m) => m,
        None => {
            debug!("PV move {} is illegal in position, dropping best move", first);
            return (None, None, None);
        }
    };

    let best_move_san = SanPlus::from_move(board.clone(), &first_move).to_string();

    let mut temp = board.clone();
    let mut line = Vec::new();
    for uci in pv.iter().take(BEST_LINE_PLIES) {
        let m = match UciMove::from_ascii(uci.as_bytes())
            .ok()
            .and_then(|uci| uci.to_move(&temp).ok())
        {
            Some(m) => m,
            None => break,
        };
        line.push(SanPlus::from_move_and_play_unchecked(&mut temp, &m).to_string());
    }
    let best_line = if line.is_empty() {
        None
    } else {
        Some(line.join(" "))
    };

    (Some(first.clone()), Some(best_move_san), best_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pv_renders_to_san_line() {
        let board = Chess::default();
        let pv: Vec<String> = ["e2e4", "e7e5", "g1f3", "b8c6", "f1c4", "g8f6"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (uci, san, line) = render_pv(&board, &pv);
        assert_eq!(uci.as_deref(), Some("e2e4"));
        assert_eq!(san.as_deref(), Some("e4"));
        assert_eq!(line.as_deref(), Some("e4 e5 Nf3 Nc6 Bc4"));
    }

    #[test]
    fn illegal_first_pv_move_drops_best_move() {
        let board = Chess::default();
        let pv = vec!["e7e5".to_string()];
        assert_eq!(render_pv(&board, &pv), (None, None, None));
    }

    #[test]
    fn stale_pv_tail_is_truncated() {
        let board = Chess::default();
        let pv: Vec<String> = ["e2e4", "e2e4", "g1f3"].iter().map(|s| s.to_string()).collect();
        let (uci, _san, line) = render_pv(&board, &pv);
        assert_eq!(uci.as_deref(), Some("e2e4"));
        assert_eq!(line.as_deref(), Some("e4"));
    }

    #[test]
    fn empty_pv_yields_nothing() {
        assert_eq!(render_pv(&Chess::default(), &[]), (None, None, None));
    }
}
