//! Backfill jobs: re-derive columns for already-analyzed games without
//! re-running engine work.

use shakmaty::{uci::UciMove, Color, Position};
use tracing::{info, warn};

use crate::chess::phase::classify_phase;
use crate::chess::tactics::classify_blunder_tactics;
use crate::error::Result;
use crate::events::{AppEvent, EventBus};
use crate::pipeline::{standard_steps, AnalysisPipeline, PipelineConfig, PipelinePreset};

use super::analyzer::GameAnalyzer;

/// Outcome counters shared by all backfill jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub games_processed: usize,
    pub items_updated: usize,
}

impl GameAnalyzer {
    /// Classify openings for analyzed games that never got one.
    pub async fn backfill_eco(&self) -> Result<BackfillReport> {
        let game_ids = self.analysis().game_ids_missing_eco()?;
        let total = game_ids.len();
        info!("backfilling ECO for {} games", total);

        let pipeline = AnalysisPipeline::new(
            PipelineConfig::from_preset(PipelinePreset::BackfillEco, false),
            standard_steps(),
        )?;
        let executor = self.executor();

        let mut report = BackfillReport::default();
        for game_id in game_ids {
            let run = executor
                .execute_pipeline(&pipeline, &game_id, Default::default(), None, None, None)
                .await;
            if run.success && run.steps_executed.iter().any(|s| s == "eco") {
                report.items_updated += 1;
            } else if !run.success {
                warn!("ECO backfill failed for {}: {:?}", game_id, run.error);
            }
            report.games_processed += 1;
            publish_backfill_progress(
                self.events(),
                "backfill_eco",
                report.games_processed,
                total,
            );
        }
        Ok(report)
    }

    /// Fill missing phase classifications straight from the game record.
    pub fn backfill_phases(&self) -> Result<BackfillReport> {
        let game_ids = self.analysis().game_ids_missing_phase()?;
        let total = game_ids.len();
        info!("backfilling phases for {} games", total);

        let mut report = BackfillReport::default();
        for game_id in game_ids {
            match self.backfill_phases_for_game(&game_id) {
                Ok(updated) => report.items_updated += updated,
                Err(e) => warn!("phase backfill failed for {}: {}", game_id, e),
            }
            report.games_processed += 1;
            publish_backfill_progress(
                self.events(),
                "backfill_phases",
                report.games_processed,
                total,
            );
        }
        Ok(report)
    }

    fn backfill_phases_for_game(&self, game_id: &str) -> Result<usize> {
        let missing = self.analysis().moves_missing_phase(game_id)?;
        if missing.is_empty() {
            return Ok(0);
        }
        let game = self.games().load_game(game_id)?;

        let mut updates = Vec::new();
        for (board, _m) in game.positions_before() {
            let move_number = board.fullmoves().get();
            let ply =
                (move_number - 1) * 2 + if board.turn() == Color::White { 1 } else { 2 };
            if missing.iter().any(|&(p, _)| p == ply) {
                updates.push((
                    classify_phase(&board, move_number),
                    game_id.to_string(),
                    ply,
                ));
            }
        }
        if !updates.is_empty() {
            self.analysis().update_move_phases(&updates)?;
        }
        Ok(updates.len())
    }

    /// Classify tactical patterns for persisted blunders that lack one.
    pub fn backfill_tactics(&self) -> Result<BackfillReport> {
        let game_ids = self.analysis().game_ids_missing_tactics()?;
        let total = game_ids.len();
        info!("backfilling tactics for {} games", total);

        let mut report = BackfillReport::default();
        for game_id in game_ids {
            match self.backfill_tactics_for_game(&game_id) {
                Ok(classified) => report.items_updated += classified,
                Err(e) => warn!("tactics backfill failed for {}: {}", game_id, e),
            }
            report.games_processed += 1;
            publish_backfill_progress(
                self.events(),
                "backfill_tactics",
                report.games_processed,
                total,
            );
        }
        Ok(report)
    }

    fn backfill_tactics_for_game(&self, game_id: &str) -> Result<usize> {
        let blunders = self.analysis().blunders_missing_tactics(game_id)?;
        if blunders.is_empty() {
            return Ok(0);
        }
        let game = self.games().load_game(game_id)?;

        // Pre-move board and played move for every ply of the game.
        let mut by_ply = std::collections::HashMap::new();
        for (board, m) in game.positions_before() {
            let move_number = board.fullmoves().get();
            let ply =
                (move_number - 1) * 2 + if board.turn() == Color::White { 1 } else { 2 };
            by_ply.insert(ply, (board, m));
        }

        let mut updates = Vec::new();
        for blunder in blunders {
            let (board_before, played) = match by_ply.get(&blunder.ply) {
                Some(entry) => entry,
                None => continue,
            };
            let best_move = blunder
                .best_move_uci
                .as_deref()
                .and_then(|uci| UciMove::from_ascii(uci.as_bytes()).ok())
                .and_then(|uci| uci.to_move(board_before).ok());

            let result =
                classify_blunder_tactics(board_before, played, best_move.as_ref(), None);
            updates.push((
                result.primary_pattern(),
                result.blunder_reason,
                game_id.to_string(),
                blunder.ply,
            ));
        }

        if !updates.is_empty() {
            self.analysis().update_move_tactics(&updates)?;
        }
        Ok(updates.len())
    }
}

/// Backfills publish progress every tenth game and on the last one.
fn publish_backfill_progress(events: &EventBus, job_type: &str, processed: usize, total: usize) {
    if processed % 10 == 0 || processed == total {
        events.publish(AppEvent::progress("", job_type, processed as u32, total as u32));
    }
}
