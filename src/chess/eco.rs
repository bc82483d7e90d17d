//! ECO opening classification.
//!
//! Openings are matched by SAN-sequence prefix: the table stores each
//! opening's move sequence, sorted longest first so the most specific entry
//! wins. The default table is embedded at compile time; a custom TSV with
//! `eco`, `name`, `pgn` columns can be loaded at runtime.

use std::io::Read;

use lazy_static::lazy_static;
use serde::Deserialize;
use shakmaty::{san::San, Chess, Position};
use tracing::debug;

use crate::error::Result;

const ECO_TSV_DATA: &[u8] = include_bytes!("../../data/eco.tsv");

/// One classified opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcoEntry {
    pub code: String,
    pub name: String,
    /// Original PGN movetext of the opening line.
    pub pgn: String,
}

#[derive(Deserialize)]
struct EcoRecord {
    eco: String,
    name: String,
    pgn: String,
}

/// Prefix-matching opening table.
#[derive(Debug, Clone)]
pub struct EcoDatabase {
    /// `(san_prefix, entry)`, sorted by descending prefix length.
    entries: Vec<(String, EcoEntry)>,
}

impl EcoDatabase {
    /// Load entries from a TSV with `eco`, `name`, `pgn` columns.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_reader(reader);
        let mut entries = Vec::new();
        for result in rdr.deserialize() {
            let record: EcoRecord = match result {
                Ok(record) => record,
                Err(e) => {
                    debug!("skipping malformed ECO record: {e}");
                    continue;
                }
            };
            let prefix = strip_move_numbers(&record.pgn);
            entries.push((
                prefix,
                EcoEntry {
                    code: record.eco,
                    name: record.name,
                    pgn: record.pgn,
                },
            ));
        }
        entries.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classify a game by its SAN move sequence. Longest prefix wins.
    pub fn classify_sans(&self, sans: &[String]) -> Option<&EcoEntry> {
        if sans.is_empty() {
            return None;
        }
        let moves_san = sans.join(" ");
        self.entries
            .iter()
            .find(|(prefix, _)| moves_san.starts_with(prefix.as_str()))
            .map(|(_, entry)| entry)
    }

    /// Classify by replaying moves from the standard starting position.
    ///
    /// SAN rendering errors truncate the sequence rather than failing the
    /// classification.
    pub fn classify_moves(&self, moves: &[shakmaty::Move]) -> Option<&EcoEntry> {
        let mut pos = Chess::default();
        let mut sans = Vec::with_capacity(moves.len());
        for m in moves {
            if !pos.is_legal(m) {
                break;
            }
            sans.push(San::from_move(&pos, m).to_string());
            pos.play_unchecked(m);
        }
        self.classify_sans(&sans)
    }
}

/// Turn PGN movetext into a bare SAN sequence, dropping move numbers.
fn strip_move_numbers(pgn: &str) -> String {
    let mut moves = Vec::new();
    for part in pgn.split_whitespace() {
        if part.ends_with('.') {
            continue;
        }
        if part.starts_with(|c: char| c.is_ascii_digit()) && part.contains('.') {
            let tail = part.rsplit('.').next().unwrap_or("");
            if !tail.is_empty() {
                moves.push(tail);
            }
        } else {
            moves.push(part);
        }
    }
    moves.join(" ")
}

lazy_static! {
    static ref ECO_DATABASE: EcoDatabase = {
        EcoDatabase::from_reader(ECO_TSV_DATA).unwrap_or_else(|e| {
            debug!("embedded ECO table failed to load: {e}");
            EcoDatabase { entries: Vec::new() }
        })
    };
}

/// The embedded default opening table.
pub fn eco_database() -> &'static EcoDatabase {
    &ECO_DATABASE
}

/// Classify a game against the embedded table.
pub fn classify_opening(game: &crate::chess::pgn::ParsedGame) -> Option<EcoEntry> {
    eco_database().classify_moves(game.mainline()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::pgn::parse_game;

    #[test]
    fn strips_move_numbers() {
        assert_eq!(strip_move_numbers("1. e4 e5 2. Nf3"), "e4 e5 Nf3");
        assert_eq!(strip_move_numbers("1.e4 e5 2.Nf3 Nc6"), "e4 e5 Nf3 Nc6");
        assert_eq!(strip_move_numbers("1. e4 1... c5"), "e4 c5");
    }

    #[test]
    fn embedded_table_loads() {
        assert!(!eco_database().is_empty());
    }

    #[test]
    fn longest_prefix_wins() {
        let tsv = "eco\tname\tpgn\nC20\tKing's Pawn Game\t1. e4 e5\nC44\tKing's Pawn Game: Tayler Opening\t1. e4 e5 2. Nf3 Nc6 3. Be2\n";
        let db = EcoDatabase::from_reader(tsv.as_bytes()).unwrap();
        let sans: Vec<String> = ["e4", "e5", "Nf3", "Nc6", "Be2", "Nf6"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let entry = db.classify_sans(&sans).unwrap();
        assert_eq!(entry.code, "C44");

        let short: Vec<String> = ["e4", "e5"].iter().map(|s| s.to_string()).collect();
        assert_eq!(db.classify_sans(&short).unwrap().code, "C20");
    }

    #[test]
    fn empty_game_has_no_opening() {
        let db = eco_database();
        assert!(db.classify_sans(&[]).is_none());
    }

    #[test]
    fn scholars_mate_is_wayward_queen() {
        let game = parse_game("1. e4 e5 2. Qh5 Nc6 3. Bc4 Nf6 4. Qxf7# 1-0").unwrap();
        let entry = classify_opening(&game).expect("scholar's mate should classify");
        assert_eq!(entry.code, "C20");
        assert!(entry.name.contains("Wayward Queen"));
    }

    #[test]
    fn unmatched_line_yields_none() {
        let game = parse_game("1. h4 a5 2. h5 a4 *").unwrap();
        assert!(classify_opening(&game).is_none());
    }
}
