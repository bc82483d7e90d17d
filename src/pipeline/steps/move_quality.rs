//! Move quality classification.
//!
//! Pure transform of the engine evaluation data: no I/O, no engine.
//! Classifies each move by its centipawn loss and attaches a best-effort
//! difficulty score describing how hard the best move was to find.

use async_trait::async_trait;
use shakmaty::{uci::UciMove, Chess, Position};

use crate::config::{Thresholds, MATE_SCORE};
use crate::error::Result;
use crate::pipeline::context::{
    MoveClass, MoveEval, ScoredMove, StepContext, StepData, StepResult,
};
use crate::pipeline::AnalysisStep;

/// Mover keeps a decisive advantage at or above this evaluation; losing a
/// forced mate into it is not treated as a blunder.
const STILL_WINNING_EVAL: i32 = 500;

/// Centipawn loss above which quiet-move difficulty starts climbing.
const DIFFICULTY_LOSS_BASE: i32 = 300;

fn classify(cp_loss: i32, thresholds: &Thresholds) -> MoveClass {
    if cp_loss >= thresholds.blunder {
        MoveClass::Blunder
    } else if cp_loss >= thresholds.mistake {
        MoveClass::Mistake
    } else if cp_loss >= thresholds.inaccuracy {
        MoveClass::Inaccuracy
    } else {
        MoveClass::Good
    }
}

/// Score how hard the best move was to find, 0 (obvious) to 100.
///
/// Checks and captures are visible; quiet moves are not. A cramped
/// position (few legal moves) and a large loss both push the score up.
/// Unknown or unparseable best moves land on a neutral 50.
pub fn compute_difficulty(
    board: &Chess,
    best_move_uci: Option<&str>,
    cp_loss: i32,
    classification: MoveClass,
) -> u8 {
    if classification == MoveClass::Good {
        return 0;
    }
    let best_move = best_move_uci
        .and_then(|uci| UciMove::from_ascii(uci.as_bytes()).ok())
        .and_then(|uci| uci.to_move(board).ok());
    let best_move = match best_move {
        Some(m) => m,
        None => return 50,
    };

    let gives_check = {
        let mut after = board.clone();
        after.play_unchecked(&best_move);
        after.is_check()
    };

    let mut score: i32 = if gives_check {
        10
    } else if best_move.is_capture() {
        15
    } else {
        40
    };

    if board.legal_moves().len() <= 5 {
        score += 30;
    }
    if cp_loss > DIFFICULTY_LOSS_BASE {
        score += ((cp_loss - DIFFICULTY_LOSS_BASE) / 10).min(20);
    }

    score.min(100) as u8
}

/// Classifies every evaluated move. Depends on the engine evaluations.
pub struct MoveQualityStep;

#[async_trait]
impl AnalysisStep for MoveQualityStep {
    fn step_id(&self) -> &'static str {
        "move_quality"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["stockfish"]
    }

    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let evals: Vec<MoveEval> = match ctx.step_result("stockfish").map(|r| &r.data) {
            Some(StepData::Evaluations(evals)) => evals.clone(),
            _ => Vec::new(),
        };
        let thresholds = ctx.thresholds;

        let mut moves = Vec::with_capacity(evals.len());
        for eval in evals {
            let (delta, cp_loss, classification) = if eval.eval_after == MATE_SCORE {
                // The move delivered checkmate; nothing was lost.
                (0, 0, MoveClass::Good)
            } else {
                let delta = eval.eval_before - eval.eval_after;
                let mut cp_loss = delta.max(0);
                if eval.score_before.is_mate() && eval.eval_after > STILL_WINNING_EVAL {
                    // A missed forced mate that still leaves a crushing
                    // position is an inaccuracy at worst.
                    cp_loss = cp_loss.min(thresholds.inaccuracy - 1);
                }
                (delta, cp_loss, classify(cp_loss, &thresholds))
            };

            let difficulty = compute_difficulty(
                &eval.position,
                eval.best_move_uci.as_deref(),
                cp_loss,
                classification,
            );

            moves.push(ScoredMove {
                ply: eval.ply,
                move_number: eval.move_number,
                player: eval.player,
                uci: eval.uci,
                san: Some(eval.san),
                eval_before: eval.eval_before,
                eval_after: eval.eval_after,
                delta,
                cp_loss,
                classification,
                best_move_uci: eval.best_move_uci,
                best_move_san: eval.best_move_san,
                best_line: eval.best_line,
                best_move_eval: eval.best_move_eval,
                game_phase: None,
                difficulty: Some(difficulty),
            });
        }

        Ok(StepResult::ok(self.step_id(), StepData::Moves(moves)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shakmaty::{fen::Fen, CastlingMode, Color};

    use crate::chess::score::{EngineScore, PovEval};
    use crate::db::games::GameStore;
    use crate::db::{AnalysisStore, Database};

    fn board(fen: &str) -> Chess {
        fen.parse::<Fen>()
            .unwrap()
            .into_position(CastlingMode::Standard)
            .unwrap()
    }

    fn eval(ply: u32, player: Color, before: i32, after: i32) -> MoveEval {
        MoveEval {
            ply,
            move_number: (ply + 1) / 2,
            player,
            uci: "e2e4".to_string(),
            san: "e4".to_string(),
            eval_before: before,
            eval_after: after,
            score_before: PovEval::new(EngineScore::Cp(before), player),
            best_move_uci: Some("e2e4".to_string()),
            best_move_san: Some("e4".to_string()),
            best_line: None,
            best_move_eval: Some(before),
            position: Chess::default(),
        }
    }

    async fn run_step(evals: Vec<MoveEval>, thresholds: Thresholds) -> Vec<ScoredMove> {
        let db = Database::open_in_memory().unwrap();
        let analysis = AnalysisStore::new(db.clone());
        let games = GameStore::new(db);
        let parsed = crate::chess::pgn::parse_game("1. e4 e5 *\n").unwrap();
        let mut ctx = StepContext::new(
            "g1".to_string(),
            parsed,
            &analysis,
            &games,
            "stockfish".to_string(),
            thresholds,
            Some(10),
            None,
            false,
            None,
        );
        ctx.add_step_result(StepResult::ok("stockfish", StepData::Evaluations(evals)));
        let result = MoveQualityStep.execute(&mut ctx).await.unwrap();
        match result.data {
            StepData::Moves(moves) => moves,
            other => panic!("unexpected data: {:?}", other),
        }
    }

    #[tokio::test]
    async fn classification_follows_thresholds() {
        let thresholds = Thresholds::default();
        let moves = run_step(
            vec![
                eval(1, Color::White, 30, 10),    // 20 lost: good
                eval(2, Color::Black, 30, -40),   // 70 lost: inaccuracy
                eval(3, Color::White, 20, -110),  // 130 lost: mistake
                eval(4, Color::Black, 10, -350),  // 360 lost: blunder
                eval(5, Color::White, -80, -30),  // improved: good
            ],
            thresholds,
        )
        .await;

        let classes: Vec<MoveClass> = moves.iter().map(|m| m.classification).collect();
        assert_eq!(
            classes,
            vec![
                MoveClass::Good,
                MoveClass::Inaccuracy,
                MoveClass::Mistake,
                MoveClass::Blunder,
                MoveClass::Good,
            ]
        );
        assert!(moves.iter().all(|m| m.cp_loss >= 0));
        assert_eq!(moves[4].delta, -50);
        assert_eq!(moves[4].cp_loss, 0);
    }

    #[tokio::test]
    async fn mate_delivered_is_always_good() {
        let moves = run_step(
            vec![eval(1, Color::White, 900, MATE_SCORE)],
            Thresholds::default(),
        )
        .await;
        assert_eq!(moves[0].classification, MoveClass::Good);
        assert_eq!(moves[0].cp_loss, 0);
        assert_eq!(moves[0].delta, 0);
    }

    #[tokio::test]
    async fn missed_mate_with_huge_lead_is_capped() {
        let mut missed = eval(1, Color::White, MATE_SCORE, 800);
        missed.score_before = PovEval::new(EngineScore::Mate(3), Color::White);
        let moves = run_step(vec![missed], Thresholds::default()).await;
        // 99_200 raw loss capped below the inaccuracy threshold.
        assert_eq!(moves[0].cp_loss, Thresholds::default().inaccuracy - 1);
        assert_eq!(moves[0].classification, MoveClass::Good);
    }

    #[tokio::test]
    async fn missed_mate_into_small_lead_is_not_capped() {
        let mut missed = eval(1, Color::White, MATE_SCORE, 300);
        missed.score_before = PovEval::new(EngineScore::Mate(3), Color::White);
        let moves = run_step(vec![missed], Thresholds::default()).await;
        assert_eq!(moves[0].classification, MoveClass::Blunder);
    }

    #[tokio::test]
    async fn raising_thresholds_never_worsens_class() {
        let make = || vec![eval(1, Color::White, 30, -150)]; // 180 lost
        let default_class = run_step(make(), Thresholds::default()).await[0].classification;
        let relaxed_class = run_step(
            make(),
            Thresholds {
                inaccuracy: 100,
                mistake: 200,
                blunder: 400,
            },
        )
        .await[0]
            .classification;
        assert!(relaxed_class <= default_class);
    }

    #[test]
    fn difficulty_good_moves_are_zero() {
        let board = Chess::default();
        assert_eq!(
            compute_difficulty(&board, Some("e2e4"), 0, MoveClass::Good),
            0
        );
    }

    #[test]
    fn difficulty_quiet_best_move_scores_high() {
        let b = board("r1bqkbnr/pppppppp/2n5/4N3/8/8/PPPPPPPP/RNBQKB1R b KQkq - 0 1");
        let score = compute_difficulty(&b, Some("d7d6"), 250, MoveClass::Blunder);
        assert!(score >= 40);
    }

    #[test]
    fn difficulty_capture_scores_lower_than_quiet() {
        let b = board("r1bqkbnr/pppppppp/2n5/4N3/8/8/PPPPPPPP/RNBQKB1R b KQkq - 0 1");
        let capture = compute_difficulty(&b, Some("c6e5"), 250, MoveClass::Blunder);
        let quiet = compute_difficulty(&b, Some("d7d6"), 250, MoveClass::Blunder);
        assert!(capture < quiet);
        assert!(capture < 40);
    }

    #[test]
    fn difficulty_check_scores_lowest() {
        let b = board("rnbqk2r/pppp1ppp/5n2/2b1p3/2B1P3/5Q2/PPPP1PPP/RNB1K1NR w KQkq - 0 1");
        let score = compute_difficulty(&b, Some("f3f7"), 300, MoveClass::Blunder);
        assert!(score <= 20);
    }

    #[test]
    fn difficulty_cramped_position_adds_bonus() {
        let b = board("7k/8/8/8/8/8/1q6/K7 w - - 0 1");
        assert!(b.legal_moves().len() <= 3);
        let score = compute_difficulty(&b, Some("a1b2"), 250, MoveClass::Blunder);
        assert!(score >= 40);
    }

    #[test]
    fn difficulty_large_loss_raises_quiet_score() {
        let b = board("r1bqkbnr/pppppppp/2n5/4N3/8/8/PPPPPPPP/RNBQKB1R b KQkq - 0 1");
        let low = compute_difficulty(&b, Some("d7d6"), 200, MoveClass::Blunder);
        let high = compute_difficulty(&b, Some("d7d6"), 500, MoveClass::Blunder);
        assert!(high > low);
    }

    #[test]
    fn difficulty_unknown_best_move_is_neutral() {
        let board = Chess::default();
        assert_eq!(compute_difficulty(&board, None, 250, MoveClass::Blunder), 50);
        assert_eq!(
            compute_difficulty(&board, Some("zzzz"), 250, MoveClass::Blunder),
            50
        );
    }

    #[test]
    fn difficulty_caps_at_100() {
        let b = board("8/8/8/8/8/6k1/8/5K2 w - - 0 1");
        let score = compute_difficulty(&b, Some("f1e1"), 500, MoveClass::Blunder);
        assert!(score <= 100);
    }
}
