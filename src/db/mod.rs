//! SQLite persistence.
//!
//! One connection in WAL mode with a busy timeout, shared by all stores.
//! Writes are short and transactional; readers are idempotent and may race
//! with writers. The schema is created by an idempotent migration batch at
//! open time.

pub mod analysis;
pub mod games;
pub mod jobs;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

pub use analysis::{AnalysisRecord, AnalysisStore, MoveRow};
pub use games::{GameRecord, GameStore, NewGame};
pub use jobs::{JobRecord, JobStatus, JobStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    game_id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    username TEXT NOT NULL,
    white TEXT,
    black TEXT,
    result TEXT,
    date TEXT,
    end_time_utc TEXT,
    time_control TEXT,
    pgn_content TEXT NOT NULL,
    analyzed INTEGER NOT NULL DEFAULT 0,
    indexed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_games_source ON games (source);
CREATE INDEX IF NOT EXISTS idx_games_username ON games (username);
CREATE INDEX IF NOT EXISTS idx_games_date ON games (end_time_utc);
CREATE INDEX IF NOT EXISTS idx_games_analyzed ON games (analyzed);

CREATE TABLE IF NOT EXISTS analysis_games (
    game_id TEXT PRIMARY KEY,
    pgn_path TEXT NOT NULL,
    analyzed_at TEXT NOT NULL,
    engine_path TEXT NOT NULL,
    depth INTEGER,
    time_limit REAL,
    inaccuracy INTEGER NOT NULL,
    mistake INTEGER NOT NULL,
    blunder INTEGER NOT NULL,
    eco_code TEXT,
    eco_name TEXT
);
CREATE INDEX IF NOT EXISTS idx_analysis_games_eco ON analysis_games (eco_code);

CREATE TABLE IF NOT EXISTS analysis_moves (
    game_id TEXT NOT NULL,
    ply INTEGER NOT NULL,
    move_number INTEGER NOT NULL,
    player INTEGER NOT NULL,
    uci TEXT NOT NULL,
    san TEXT,
    eval_before INTEGER NOT NULL,
    eval_after INTEGER NOT NULL,
    delta INTEGER NOT NULL,
    cp_loss INTEGER NOT NULL,
    classification INTEGER NOT NULL,
    best_move_uci TEXT,
    best_move_san TEXT,
    best_line TEXT,
    best_move_eval INTEGER,
    game_phase INTEGER,
    tactical_pattern INTEGER,
    tactical_reason TEXT,
    difficulty INTEGER,
    PRIMARY KEY (game_id, ply)
);
CREATE INDEX IF NOT EXISTS idx_analysis_moves_game ON analysis_moves (game_id);
CREATE INDEX IF NOT EXISTS idx_analysis_moves_class ON analysis_moves (classification);
CREATE INDEX IF NOT EXISTS idx_analysis_moves_cpl ON analysis_moves (cp_loss);
CREATE INDEX IF NOT EXISTS idx_analysis_moves_phase ON analysis_moves (game_phase);
CREATE INDEX IF NOT EXISTS idx_analysis_moves_tactical ON analysis_moves (tactical_pattern);

CREATE TABLE IF NOT EXISTS analysis_step_status (
    game_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (game_id, step_id)
);
CREATE INDEX IF NOT EXISTS idx_step_status_game ON analysis_step_status (game_id);

CREATE TABLE IF NOT EXISTS background_jobs (
    job_id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    username TEXT,
    source TEXT,
    max_games INTEGER,
    progress_current INTEGER NOT NULL DEFAULT 0,
    progress_total INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    result_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON background_jobs (status);
CREATE INDEX IF NOT EXISTS idx_jobs_type ON background_jobs (job_type);
"#;

/// Shared handle to the single SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA)?;
        debug!("database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the shared connection. Poisoning is recovered: a panicked
    /// writer leaves SQLite itself consistent.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// UTC timestamp in RFC 3339, the format all tables store.
pub(crate) fn utc_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.lock().execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/test.sqlite3");
        let _db = Database::open(&path).unwrap();
        assert!(path.exists());
    }
}
