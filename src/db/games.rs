//! Game storage: imported PGNs keyed by content hash.

use rusqlite::{params, OptionalExtension, Row};

use crate::chess::pgn::{self, ParsedGame};
use crate::error::{Error, Result};

use super::{utc_now, Database};

/// A stored game row.
#[derive(Debug, Clone)]
pub struct GameRecord {
    pub game_id: String,
    pub source: String,
    pub username: String,
    pub white: Option<String>,
    pub black: Option<String>,
    pub result: Option<String>,
    pub date: Option<String>,
    pub end_time_utc: Option<String>,
    pub time_control: Option<String>,
    pub pgn_content: String,
    pub analyzed: bool,
}

/// A game prepared for insertion. Built from raw PGN text; the id is the
/// SHA-256 of the normalized movetext, so equal games collapse to one row.
#[derive(Debug, Clone)]
pub struct NewGame {
    pub game_id: String,
    pub source: String,
    pub username: String,
    pub white: Option<String>,
    pub black: Option<String>,
    pub result: Option<String>,
    pub date: Option<String>,
    pub end_time_utc: Option<String>,
    pub time_control: Option<String>,
    pub pgn_content: String,
}

impl NewGame {
    pub fn from_pgn(pgn_text: &str, source: &str, username: &str) -> Result<Self> {
        let normalized = pgn::normalize_pgn(pgn_text);
        let game = pgn::parse_game(&normalized)?;
        let date = game.header("UTCDate").or_else(|| game.header("Date"));
        let time = game.header("UTCTime").or_else(|| game.header("Time"));
        let end_time_utc = pgn::parse_pgn_datetime(date, time);

        Ok(Self {
            game_id: pgn::compute_game_id(&normalized),
            source: source.to_string(),
            username: username.to_string(),
            white: game.header("White").map(str::to_string),
            black: game.header("Black").map(str::to_string),
            result: game.header("Result").map(str::to_string),
            date: game.header("Date").map(str::to_string),
            end_time_utc,
            time_control: game.header("TimeControl").map(str::to_string),
            pgn_content: normalized,
        })
    }
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<GameRecord> {
    Ok(GameRecord {
        game_id: row.get(0)?,
        source: row.get(1)?,
        username: row.get(2)?,
        white: row.get(3)?,
        black: row.get(4)?,
        result: row.get(5)?,
        date: row.get(6)?,
        end_time_utc: row.get(7)?,
        time_control: row.get(8)?,
        pgn_content: row.get(9)?,
        analyzed: row.get::<_, i64>(10)? != 0,
    })
}

/// Repository over the `games` table.
#[derive(Clone)]
pub struct GameStore {
    db: Database,
}

impl GameStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert games, ignoring ids already present. Returns how many rows
    /// were actually inserted.
    pub fn insert_games(&self, games: &[NewGame]) -> Result<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let timestamp = utc_now();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO games (
                    game_id, source, username, white, black, result,
                    date, end_time_utc, time_control, pgn_content, analyzed, indexed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)
                 ON CONFLICT(game_id) DO NOTHING",
            )?;
            for game in games {
                inserted += stmt.execute(params![
                    game.game_id,
                    game.source,
                    game.username,
                    game.white,
                    game.black,
                    game.result,
                    game.date,
                    game.end_time_utc,
                    game.time_control,
                    game.pgn_content,
                    timestamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>> {
        let conn = self.db.lock();
        let record = conn
            .query_row(
                "SELECT game_id, source, username, white, black, result,
                        date, end_time_utc, time_control, pgn_content, analyzed
                 FROM games WHERE game_id = ?1",
                params![game_id],
                game_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn pgn_content(&self, game_id: &str) -> Result<String> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT pgn_content FROM games WHERE game_id = ?1",
            params![game_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::GameNotFound(game_id.to_string()))
    }

    /// Load and parse a stored game's mainline.
    pub fn load_game(&self, game_id: &str) -> Result<ParsedGame> {
        let content = self.pgn_content(game_id)?;
        pgn::parse_game(&content)
    }

    /// Ids of games not yet analyzed, newest first.
    pub fn list_unanalyzed_game_ids(
        &self,
        source: Option<&str>,
        username: Option<&str>,
    ) -> Result<Vec<String>> {
        self.list_ids(source, username, false)
    }

    /// All game ids matching the filter, newest first.
    pub fn list_game_ids(
        &self,
        source: Option<&str>,
        username: Option<&str>,
    ) -> Result<Vec<String>> {
        self.list_ids(source, username, true)
    }

    fn list_ids(
        &self,
        source: Option<&str>,
        username: Option<&str>,
        include_analyzed: bool,
    ) -> Result<Vec<String>> {
        let mut query = String::from("SELECT game_id FROM games WHERE 1=1");
        let mut args: Vec<&str> = Vec::new();
        if !include_analyzed {
            query.push_str(" AND analyzed = 0");
        }
        if let Some(source) = source {
            query.push_str(" AND source = ?");
            args.push(source);
        }
        if let Some(username) = username {
            query.push_str(" AND username = ?");
            args.push(username);
        }
        query.push_str(" ORDER BY end_time_utc DESC");

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    pub fn mark_game_analyzed(&self, game_id: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE games SET analyzed = 1 WHERE game_id = ?1",
            params![game_id],
        )?;
        Ok(())
    }

    pub fn count_games(&self, source: Option<&str>, username: Option<&str>) -> Result<u64> {
        let mut query = String::from("SELECT COUNT(*) FROM games WHERE 1=1");
        let mut args: Vec<&str> = Vec::new();
        if let Some(source) = source {
            query.push_str(" AND source = ?");
            args.push(source);
        }
        if let Some(username) = username {
            query.push_str(" AND username = ?");
            args.push(username);
        }
        let conn = self.db.lock();
        let count: i64 =
            conn.query_row(&query, rusqlite::params_from_iter(args), |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PGN: &str = "[White \"alice\"]\n[Black \"bob\"]\n[Result \"1-0\"]\n[UTCDate \"2024.03.01\"]\n[UTCTime \"18:00:00\"]\n[TimeControl \"300\"]\n\n1. e4 e5 2. Nf3 Nc6 1-0\n";

    fn store() -> GameStore {
        GameStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn insert_is_idempotent_on_game_id() {
        let store = store();
        let game = NewGame::from_pgn(PGN, "lichess", "alice").unwrap();
        assert_eq!(store.insert_games(&[game.clone()]).unwrap(), 1);
        assert_eq!(store.insert_games(&[game]).unwrap(), 0);
        assert_eq!(store.count_games(None, None).unwrap(), 1);
    }

    #[test]
    fn metadata_extracted_from_headers() {
        let game = NewGame::from_pgn(PGN, "lichess", "alice").unwrap();
        assert_eq!(game.white.as_deref(), Some("alice"));
        assert_eq!(game.black.as_deref(), Some("bob"));
        assert_eq!(game.result.as_deref(), Some("1-0"));
        assert_eq!(game.time_control.as_deref(), Some("300"));
        assert!(game.end_time_utc.as_deref().unwrap().starts_with("2024-03-01T18:00:00"));
        assert_eq!(game.game_id.len(), 64);
    }

    #[test]
    fn load_game_round_trips() {
        let store = store();
        let game = NewGame::from_pgn(PGN, "lichess", "alice").unwrap();
        let id = game.game_id.clone();
        store.insert_games(&[game]).unwrap();

        let parsed = store.load_game(&id).unwrap();
        assert_eq!(parsed.ply_count(), 4);
        assert_eq!(parsed.header("White"), Some("alice"));
    }

    #[test]
    fn missing_game_is_an_error() {
        let store = store();
        assert!(matches!(
            store.load_game("missing"),
            Err(Error::GameNotFound(_))
        ));
    }

    #[test]
    fn unanalyzed_filter_and_mark() {
        let store = store();
        let game = NewGame::from_pgn(PGN, "lichess", "alice").unwrap();
        let id = game.game_id.clone();
        store.insert_games(&[game]).unwrap();

        assert_eq!(store.list_unanalyzed_game_ids(None, None).unwrap(), vec![id.clone()]);
        assert!(store
            .list_unanalyzed_game_ids(Some("chesscom"), None)
            .unwrap()
            .is_empty());

        store.mark_game_analyzed(&id).unwrap();
        assert!(store.list_unanalyzed_game_ids(None, None).unwrap().is_empty());
        assert_eq!(store.list_game_ids(None, None).unwrap().len(), 1);
        assert!(store.get_game(&id).unwrap().unwrap().analyzed);
    }
}
