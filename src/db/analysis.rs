//! Analysis storage: per-game records, per-ply move rows, and step
//! completion markers.

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension, Row};
use shakmaty::Color;

use crate::chess::phase::GamePhase;
use crate::chess::tactics::TacticalPattern;
use crate::config::Thresholds;
use crate::error::Result;
use crate::pipeline::context::{MoveClass, ScoredMove};

use super::{utc_now, Database};

/// Per-game analysis aggregate. Replaced wholesale on re-analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub game_id: String,
    pub pgn_path: String,
    pub analyzed_at: String,
    pub engine_path: String,
    pub depth: Option<u32>,
    pub time_limit: Option<f64>,
    pub thresholds: Thresholds,
    pub eco_code: Option<String>,
    pub eco_name: Option<String>,
}

/// One persisted move row.
#[derive(Debug, Clone)]
pub struct MoveRow {
    pub game_id: String,
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
    pub tactical_pattern: Option<TacticalPattern>,
    pub tactical_reason: Option<String>,
    pub difficulty: Option<u8>,
}

fn move_from_row(row: &Row<'_>) -> rusqlite::Result<MoveRow> {
    Ok(MoveRow {
        game_id: row.get(0)?,
        ply: row.get::<_, i64>(1)? as u32,
        move_number: row.get::<_, i64>(2)? as u32,
        player: if row.get::<_, i64>(3)? == 0 {
            Color::White
        } else {
            Color::Black
        },
        uci: row.get(4)?,
        san: row.get(5)?,
        eval_before: row.get(6)?,
        eval_after: row.get(7)?,
        delta: row.get(8)?,
        cp_loss: row.get(9)?,
        classification: MoveClass::from_i64(row.get(10)?).unwrap_or(MoveClass::Good),
        best_move_uci: row.get(11)?,
        best_move_san: row.get(12)?,
        best_line: row.get(13)?,
        best_move_eval: row.get(14)?,
        game_phase: row.get::<_, Option<i64>>(15)?.and_then(GamePhase::from_i64),
        tactical_pattern: row
            .get::<_, Option<i64>>(16)?
            .and_then(TacticalPattern::from_i64),
        tactical_reason: row.get(17)?,
        difficulty: row.get::<_, Option<i64>>(18)?.map(|d| d as u8),
    })
}

const MOVE_COLUMNS: &str = "game_id, ply, move_number, player, uci, san, \
     eval_before, eval_after, delta, cp_loss, classification, \
     best_move_uci, best_move_san, best_line, best_move_eval, game_phase, \
     tactical_pattern, tactical_reason, difficulty";

fn upsert_record(conn: &rusqlite::Connection, record: &AnalysisRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO analysis_games (
            game_id, pgn_path, analyzed_at, engine_path, depth, time_limit,
            inaccuracy, mistake, blunder, eco_code, eco_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.game_id,
            record.pgn_path,
            record.analyzed_at,
            record.engine_path,
            record.depth,
            record.time_limit,
            record.thresholds.inaccuracy,
            record.thresholds.mistake,
            record.thresholds.blunder,
            record.eco_code,
            record.eco_name,
        ],
    )?;
    Ok(())
}

/// A blunder row awaiting tactical classification.
#[derive(Debug, Clone)]
pub struct PendingBlunder {
    pub game_id: String,
    pub ply: u32,
    pub best_move_uci: Option<String>,
}

/// Repository over `analysis_games`, `analysis_moves`, and
/// `analysis_step_status`.
#[derive(Clone)]
pub struct AnalysisStore {
    db: Database,
}

impl AnalysisStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn analysis_exists(&self, game_id: &str) -> Result<bool> {
        let conn = self.db.lock();
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM analysis_games WHERE game_id = ?1 LIMIT 1",
                params![game_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub fn get_analysis(&self, game_id: &str) -> Result<Option<AnalysisRecord>> {
        let conn = self.db.lock();
        let record = conn
            .query_row(
                "SELECT game_id, pgn_path, analyzed_at, engine_path, depth, time_limit,
                        inaccuracy, mistake, blunder, eco_code, eco_name
                 FROM analysis_games WHERE game_id = ?1",
                params![game_id],
                |row| {
                    Ok(AnalysisRecord {
                        game_id: row.get(0)?,
                        pgn_path: row.get(1)?,
                        analyzed_at: row.get(2)?,
                        engine_path: row.get(3)?,
                        depth: row.get::<_, Option<i64>>(4)?.map(|d| d as u32),
                        time_limit: row.get(5)?,
                        thresholds: Thresholds {
                            inaccuracy: row.get(6)?,
                            mistake: row.get(7)?,
                            blunder: row.get(8)?,
                        },
                        eco_code: row.get(9)?,
                        eco_name: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Upsert the per-game record without touching move rows. Used when a
    /// resumed run re-writes the record while the moves are already
    /// persisted and intact.
    pub fn write_record(&self, record: &AnalysisRecord) -> Result<()> {
        let conn = self.db.lock();
        upsert_record(&conn, record)?;
        Ok(())
    }

    /// Replace a game's analysis atomically: upsert the record, delete all
    /// existing move rows, batch-insert the new ones. One transaction.
    pub fn write_analysis(&self, record: &AnalysisRecord, moves: &[ScoredMove]) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        upsert_record(&tx, record)?;

        tx.execute(
            "DELETE FROM analysis_moves WHERE game_id = ?1",
            params![record.game_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO analysis_moves (
                    game_id, ply, move_number, player, uci, san,
                    eval_before, eval_after, delta, cp_loss, classification,
                    best_move_uci, best_move_san, best_line, best_move_eval,
                    game_phase, difficulty
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;
            for m in moves {
                stmt.execute(params![
                    record.game_id,
                    m.ply,
                    m.move_number,
                    if m.player == Color::White { 0 } else { 1 },
                    m.uci,
                    m.san,
                    m.eval_before,
                    m.eval_after,
                    m.delta,
                    m.cp_loss,
                    m.classification.as_i64(),
                    m.best_move_uci,
                    m.best_move_san,
                    m.best_line,
                    m.best_move_eval,
                    m.game_phase.map(GamePhase::as_i64),
                    m.difficulty,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_moves(&self, game_id: &str) -> Result<Vec<MoveRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MOVE_COLUMNS} FROM analysis_moves WHERE game_id = ?1 ORDER BY ply"
        ))?;
        let rows = stmt.query_map(params![game_id], move_from_row)?;
        let mut moves = Vec::new();
        for row in rows {
            moves.push(row?);
        }
        Ok(moves)
    }

    pub fn count_moves(&self, game_id: &str) -> Result<u64> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_moves WHERE game_id = ?1",
            params![game_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn update_game_eco(
        &self,
        game_id: &str,
        eco_code: Option<&str>,
        eco_name: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE analysis_games SET eco_code = ?1, eco_name = ?2 WHERE game_id = ?3",
            params![eco_code, eco_name, game_id],
        )?;
        Ok(())
    }

    /// Analyzed games with no opening and no completed `eco` step.
    pub fn game_ids_missing_eco(&self) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT ag.game_id FROM analysis_games ag
             WHERE ag.eco_code IS NULL
             AND NOT EXISTS (
                 SELECT 1 FROM analysis_step_status ss
                 WHERE ss.game_id = ag.game_id AND ss.step_id = 'eco'
             )",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Games whose move rows still lack a phase classification.
    pub fn game_ids_missing_phase(&self) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT game_id FROM analysis_moves WHERE game_phase IS NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Games with blunders that have not been tactically classified.
    pub fn game_ids_missing_tactics(&self) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT game_id FROM analysis_moves
             WHERE classification = 3 AND tactical_pattern IS NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Blunder rows of one game that still need a tactical pattern.
    pub fn blunders_missing_tactics(&self, game_id: &str) -> Result<Vec<PendingBlunder>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT game_id, ply, best_move_uci FROM analysis_moves
             WHERE game_id = ?1 AND classification = 3 AND tactical_pattern IS NULL
             ORDER BY ply",
        )?;
        let rows = stmt.query_map(params![game_id], |row| {
            Ok(PendingBlunder {
                game_id: row.get(0)?,
                ply: row.get::<_, i64>(1)? as u32,
                best_move_uci: row.get(2)?,
            })
        })?;
        let mut blunders = Vec::new();
        for row in rows {
            blunders.push(row?);
        }
        Ok(blunders)
    }

    /// Batch-update tactical classifications: `(pattern, reason, game_id, ply)`.
    pub fn update_move_tactics(
        &self,
        updates: &[(TacticalPattern, String, String, u32)],
    ) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE analysis_moves SET tactical_pattern = ?1, tactical_reason = ?2
                 WHERE game_id = ?3 AND ply = ?4",
            )?;
            for (pattern, reason, game_id, ply) in updates {
                stmt.execute(params![pattern.as_i64(), reason, game_id, ply])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Batch-update phases: `(phase, game_id, ply)`.
    pub fn update_move_phases(&self, updates: &[(GamePhase, String, u32)]) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE analysis_moves SET game_phase = ?1 WHERE game_id = ?2 AND ply = ?3",
            )?;
            for (phase, game_id, ply) in updates {
                stmt.execute(params![phase.as_i64(), game_id, ply])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Move rows of one game that still lack a phase.
    pub fn moves_missing_phase(&self, game_id: &str) -> Result<Vec<(u32, u32)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT ply, move_number FROM analysis_moves
             WHERE game_id = ?1 AND game_phase IS NULL ORDER BY ply",
        )?;
        let rows = stmt.query_map(params![game_id], |row| {
            Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u32))
        })?;
        let mut moves = Vec::new();
        for row in rows {
            moves.push(row?);
        }
        Ok(moves)
    }

    pub fn is_step_completed(&self, game_id: &str, step_id: &str) -> Result<bool> {
        let conn = self.db.lock();
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM analysis_step_status
                 WHERE game_id = ?1 AND step_id = ?2 LIMIT 1",
                params![game_id, step_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub fn mark_step_completed(&self, game_id: &str, step_id: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO analysis_step_status (game_id, step_id, completed_at)
             VALUES (?1, ?2, ?3)",
            params![game_id, step_id, utc_now()],
        )?;
        Ok(())
    }

    pub fn completed_steps(&self, game_id: &str) -> Result<HashSet<String>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT step_id FROM analysis_step_status WHERE game_id = ?1")?;
        let rows = stmt.query_map(params![game_id], |row| row.get(0))?;
        let mut steps = HashSet::new();
        for step in rows {
            steps.insert(step?);
        }
        Ok(steps)
    }

    /// Remove one step's completion marker, forcing it to re-run.
    pub fn clear_step(&self, game_id: &str, step_id: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM analysis_step_status WHERE game_id = ?1 AND step_id = ?2",
            params![game_id, step_id],
        )?;
        Ok(())
    }

    /// Remove all of a game's step completion markers.
    pub fn clear_step_status(&self, game_id: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM analysis_step_status WHERE game_id = ?1",
            params![game_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AnalysisStore {
        AnalysisStore::new(Database::open_in_memory().unwrap())
    }

    fn sample_record(game_id: &str) -> AnalysisRecord {
        AnalysisRecord {
            game_id: game_id.to_string(),
            pgn_path: String::new(),
            analyzed_at: "2024-03-01T18:00:00+00:00".to_string(),
            engine_path: "/usr/bin/stockfish".to_string(),
            depth: Some(14),
            time_limit: None,
            thresholds: Thresholds::default(),
            eco_code: Some("C20".to_string()),
            eco_name: Some("King's Pawn Game".to_string()),
        }
    }

    fn sample_move(ply: u32, classification: MoveClass) -> ScoredMove {
        ScoredMove {
            ply,
            move_number: (ply + 1) / 2,
            player: if ply % 2 == 1 {
                Color::White
            } else {
                Color::Black
            },
            uci: "e2e4".to_string(),
            san: Some("e4".to_string()),
            eval_before: 30,
            eval_after: 10,
            delta: 20,
            cp_loss: 20,
            classification,
            best_move_uci: Some("e2e4".to_string()),
            best_move_san: Some("e4".to_string()),
            best_line: Some("e4 e5".to_string()),
            best_move_eval: Some(30),
            game_phase: Some(GamePhase::Opening),
            difficulty: Some(0),
        }
    }

    #[test]
    fn write_analysis_replaces_previous_run() {
        let store = store();
        let record = sample_record("g1");
        let moves: Vec<ScoredMove> =
            (1..=4).map(|ply| sample_move(ply, MoveClass::Good)).collect();
        store.write_analysis(&record, &moves).unwrap();
        assert!(store.analysis_exists("g1").unwrap());
        assert_eq!(store.count_moves("g1").unwrap(), 4);

        // Re-running replaces, never duplicates.
        let shorter: Vec<ScoredMove> =
            (1..=2).map(|ply| sample_move(ply, MoveClass::Blunder)).collect();
        store.write_analysis(&record, &shorter).unwrap();
        assert_eq!(store.count_moves("g1").unwrap(), 2);

        let stored = store.get_analysis("g1").unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn other_games_are_untouched_by_replacement() {
        let store = store();
        store
            .write_analysis(&sample_record("g1"), &[sample_move(1, MoveClass::Good)])
            .unwrap();
        store
            .write_analysis(&sample_record("g2"), &[sample_move(1, MoveClass::Good)])
            .unwrap();

        store.write_analysis(&sample_record("g1"), &[]).unwrap();
        assert_eq!(store.count_moves("g1").unwrap(), 0);
        assert_eq!(store.count_moves("g2").unwrap(), 1);
    }

    #[test]
    fn step_status_round_trip() {
        let store = store();
        assert!(!store.is_step_completed("g1", "eco").unwrap());

        store.mark_step_completed("g1", "eco").unwrap();
        store.mark_step_completed("g1", "phase").unwrap();
        assert!(store.is_step_completed("g1", "eco").unwrap());
        assert_eq!(store.completed_steps("g1").unwrap().len(), 2);

        // Re-marking is idempotent.
        store.mark_step_completed("g1", "eco").unwrap();
        assert_eq!(store.completed_steps("g1").unwrap().len(), 2);

        store.clear_step("g1", "eco").unwrap();
        assert!(!store.is_step_completed("g1", "eco").unwrap());
        assert!(store.is_step_completed("g1", "phase").unwrap());

        store.clear_step_status("g1").unwrap();
        assert!(store.completed_steps("g1").unwrap().is_empty());
    }

    #[test]
    fn eco_update_applies_to_existing_record() {
        let store = store();
        store.write_analysis(&sample_record("g1"), &[]).unwrap();
        store
            .update_game_eco("g1", Some("B20"), Some("Sicilian Defense"))
            .unwrap();
        let record = store.get_analysis("g1").unwrap().unwrap();
        assert_eq!(record.eco_code.as_deref(), Some("B20"));
    }

    #[test]
    fn tactics_backfill_queries_and_updates() {
        let store = store();
        let record = sample_record("g1");
        let moves = vec![
            sample_move(1, MoveClass::Good),
            sample_move(2, MoveClass::Blunder),
        ];
        store.write_analysis(&record, &moves).unwrap();

        assert_eq!(store.game_ids_missing_tactics().unwrap(), vec!["g1"]);
        let pending = store.blunders_missing_tactics("g1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ply, 2);

        store
            .update_move_tactics(&[(
                TacticalPattern::HangingPiece,
                "Created hanging queen".to_string(),
                "g1".to_string(),
                2,
            )])
            .unwrap();
        assert!(store.game_ids_missing_tactics().unwrap().is_empty());

        let rows = store.fetch_moves("g1").unwrap();
        let blunder = rows.iter().find(|r| r.ply == 2).unwrap();
        assert_eq!(blunder.tactical_pattern, Some(TacticalPattern::HangingPiece));
        assert_eq!(blunder.tactical_reason.as_deref(), Some("Created hanging queen"));
    }

    #[test]
    fn phase_backfill_queries_and_updates() {
        let store = store();
        let record = sample_record("g1");
        let mut unphased = sample_move(1, MoveClass::Good);
        unphased.game_phase = None;
        store.write_analysis(&record, &[unphased]).unwrap();

        assert_eq!(store.game_ids_missing_phase().unwrap(), vec!["g1"]);
        assert_eq!(store.moves_missing_phase("g1").unwrap(), vec![(1, 1)]);

        store
            .update_move_phases(&[(GamePhase::Opening, "g1".to_string(), 1)])
            .unwrap();
        assert!(store.game_ids_missing_phase().unwrap().is_empty());
    }
}
