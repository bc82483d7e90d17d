//! PGN parsing and normalization.
//!
//! Games are identified by a content hash of their normalized PGN text, so
//! normalization must be deterministic: CRLF/CR collapsed to LF, surrounding
//! whitespace stripped, exactly one trailing newline.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use pgn_reader::{BufferedReader, RawHeader, SanPlus, Skip, Visitor};
use shakmaty::{fen::Fen, CastlingMode, Chess, Move, Position};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// A parsed game: headers plus the mainline, variations skipped.
#[derive(Debug, Clone)]
pub struct ParsedGame {
    headers: HashMap<String, String>,
    root: Chess,
    moves: Vec<Move>,
    sans: Vec<String>,
}

impl ParsedGame {
    /// Starting position of the game (honors a `FEN` header).
    pub fn root(&self) -> Chess {
        self.root.clone()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Mainline moves in order.
    pub fn mainline(&self) -> &[Move] {
        &self.moves
    }

    /// Mainline moves in SAN.
    pub fn sans(&self) -> &[String] {
        &self.sans
    }

    pub fn ply_count(&self) -> usize {
        self.moves.len()
    }

    /// Walk the mainline, yielding the board before each move.
    pub fn positions_before(&self) -> Vec<(Chess, Move)> {
        let mut pos = self.root();
        let mut out = Vec::with_capacity(self.moves.len());
        for m in &self.moves {
            out.push((pos.clone(), m.clone()));
            pos.play_unchecked(m);
        }
        out
    }
}

struct GameCollector {
    headers: HashMap<String, String>,
    root: Option<Chess>,
    pos: Chess,
    moves: Vec<Move>,
    sans: Vec<String>,
    error: Option<Error>,
}

impl GameCollector {
    fn new() -> Self {
        Self {
            headers: HashMap::new(),
            root: None,
            pos: Chess::default(),
            moves: Vec::new(),
            sans: Vec::new(),
            error: None,
        }
    }
}

impl Visitor for GameCollector {
    type Result = ParsedGame;

    fn begin_game(&mut self) {
        self.headers.clear();
        self.root = None;
        self.pos = Chess::default();
        self.moves.clear();
        self.sans.clear();
        self.error = None;
    }

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        let key = String::from_utf8_lossy(key).into_owned();
        let value = value.decode_utf8_lossy().into_owned();
        self.headers.insert(key, value);
    }

    fn end_headers(&mut self) -> Skip {
        if let Some(fen) = self.headers.get("FEN") {
            match fen
                .parse::<Fen>()
                .map_err(Error::from)
                .and_then(|f| f.into_position(CastlingMode::Standard).map_err(Error::from))
            {
                Ok(pos) => {
                    self.root = Some(pos);
                }
                Err(e) => {
                    debug!("invalid FEN header, falling back to standard start: {e}");
                }
            }
        }
        self.pos = self.root.clone().unwrap_or_default();
        Skip(false)
    }

    fn san(&mut self, san_plus: SanPlus) {
        if self.error.is_some() {
            return;
        }
        match san_plus.san.to_move(&self.pos) {
            Ok(m) => {
                self.sans.push(san_plus.to_string());
                self.pos.play_unchecked(&m);
                self.moves.push(m);
            }
            Err(e) => {
                self.error = Some(Error::InvalidPgn(format!(
                    "illegal move {} at ply {}: {}",
                    san_plus,
                    self.moves.len() + 1,
                    e
                )));
            }
        }
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn end_game(&mut self) -> Self::Result {
        ParsedGame {
            headers: std::mem::take(&mut self.headers),
            root: self.root.take().unwrap_or_default(),
            moves: std::mem::take(&mut self.moves),
            sans: std::mem::take(&mut self.sans),
        }
    }
}

/// Parse the first game in a PGN string.
pub fn parse_game(pgn: &str) -> Result<ParsedGame> {
    let mut reader = BufferedReader::new_cursor(pgn.as_bytes());
    let mut collector = GameCollector::new();
    let game = reader
        .read_game(&mut collector)?
        .ok_or_else(|| Error::InvalidPgn("no game in input".to_string()))?;
    if let Some(err) = collector.error.take() {
        return Err(err);
    }
    Ok(game)
}

/// Parse every game in a PGN string, skipping ones with illegal moves.
pub fn parse_games(pgn: &str) -> Result<Vec<ParsedGame>> {
    let mut reader = BufferedReader::new_cursor(pgn.as_bytes());
    let mut collector = GameCollector::new();
    let mut games = Vec::new();
    while let Some(game) = reader.read_game(&mut collector)? {
        match collector.error.take() {
            None => games.push(game),
            Some(e) => debug!("skipping unparseable game: {e}"),
        }
    }
    Ok(games)
}

/// Split a multi-game PGN file into per-game chunks.
///
/// Games are cut before each `[Event` header line. Content with no such
/// header is treated as a single game. The chunks keep their original
/// text so content hashing sees exactly what was imported.
pub fn split_pgn_games(content: &str) -> Vec<String> {
    let mut games: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.trim_start().starts_with("[Event ") && !current.trim().is_empty() {
            games.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        games.push(current);
    }
    games
}

/// Normalize PGN text: LF line endings, trimmed, one trailing newline.
pub fn normalize_pgn(pgn: &str) -> String {
    let mut normalized = pgn.trim().replace("\r\n", "\n").replace('\r', "\n");
    normalized.push('\n');
    normalized
}

/// Content-hash game id: SHA-256 of the normalized PGN, lowercase hex.
pub fn compute_game_id(normalized_pgn: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_pgn.as_bytes());
    hex::encode(hasher.finalize())
}

/// Combine PGN `UTCDate`/`UTCTime` style headers into an RFC 3339 timestamp.
pub fn parse_pgn_datetime(date: Option<&str>, time: Option<&str>) -> Option<String> {
    let date = NaiveDate::parse_from_str(date?, "%Y.%m.%d").ok()?;
    let time = time
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M:%S").ok())
        .unwrap_or(NaiveTime::MIN);
    let dt = Utc.from_utc_datetime(&date.and_time(time));
    Some(dt.to_rfc3339())
}
