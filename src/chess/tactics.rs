//! Tactical pattern detection.
//!
//! Classifies blunders by the motif that explains them, from two angles:
//! the MISSED tactic (what the engine's best move exploited) and the
//! ALLOWED tactic (what the opponent can now do to us). Detectors work on
//! the raw board with attack bitboards; no engine involvement.

use serde::{Deserialize, Serialize};
use shakmaty::{
    attacks, Bitboard, Chess, Color, Move, Position, Role, Square,
};

/// Tactical motif taxonomy. Stored in the database by discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TacticalPattern {
    None = 0,
    Fork = 1,
    Pin = 2,
    Skewer = 3,
    DiscoveredAttack = 4,
    DiscoveredCheck = 5,
    DoubleCheck = 6,
    BackRankThreat = 7,
    TrappedPiece = 8,
    HangingPiece = 9,
    RemovalOfDefender = 10,
    OverloadedPiece = 11,
}

impl TacticalPattern {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        use TacticalPattern::*;
        match value {
            0 => Some(None),
            1 => Some(Fork),
            2 => Some(Pin),
            3 => Some(Skewer),
            4 => Some(DiscoveredAttack),
            5 => Some(DiscoveredCheck),
            6 => Some(DoubleCheck),
            7 => Some(BackRankThreat),
            8 => Some(TrappedPiece),
            9 => Some(HangingPiece),
            10 => Some(RemovalOfDefender),
            11 => Some(OverloadedPiece),
            _ => Option::None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TacticalPattern::None => "None",
            TacticalPattern::Fork => "Fork",
            TacticalPattern::Pin => "Pin",
            TacticalPattern::Skewer => "Skewer",
            TacticalPattern::DiscoveredAttack => "Discovered Attack",
            TacticalPattern::DiscoveredCheck => "Discovered Check",
            TacticalPattern::DoubleCheck => "Double Check",
            TacticalPattern::BackRankThreat => "Back Rank Threat",
            TacticalPattern::TrappedPiece => "Trapped Piece",
            TacticalPattern::HangingPiece => "Hanging Piece",
            TacticalPattern::RemovalOfDefender => "Removal of Defender",
            TacticalPattern::OverloadedPiece => "Overloaded Piece",
        }
    }
}

/// One detected motif with the squares involved and its expected yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TacticalMotif {
    pub pattern: TacticalPattern,
    pub description: String,
    pub squares: Vec<Square>,
    /// Expected material gain in centipawns.
    pub material_gain: i32,
}

/// Tactical explanation of a blunder.
#[derive(Debug, Clone, Default)]
pub struct BlunderTactics {
    /// Tactic the best move would have exploited.
    pub missed_tactic: Option<TacticalMotif>,
    /// Tactic the opponent can now execute (or weakness we created).
    pub allowed_tactic: Option<TacticalMotif>,
    pub blunder_reason: String,
}

impl BlunderTactics {
    /// The most significant pattern: a concrete material gain outranks a
    /// merely structural motif, and a missed win outranks an allowed one.
    pub fn primary_pattern(&self) -> TacticalPattern {
        if let Some(missed) = &self.missed_tactic {
            if missed.material_gain > 0 {
                return missed.pattern;
            }
        }
        if let Some(allowed) = &self.allowed_tactic {
            if allowed.material_gain > 0 {
                return allowed.pattern;
            }
        }
        if let Some(missed) = &self.missed_tactic {
            return missed.pattern;
        }
        if let Some(allowed) = &self.allowed_tactic {
            return allowed.pattern;
        }
        TacticalPattern::None
    }

    pub fn primary_pattern_name(&self) -> &'static str {
        self.primary_pattern().label()
    }
}

fn piece_value(role: Role) -> i32 {
    match role {
        Role::Pawn => 100,
        Role::Knight => 320,
        Role::Bishop => 330,
        Role::Rook => 500,
        Role::Queen => 900,
        Role::King => 20_000,
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Pawn => "pawn",
        Role::Knight => "knight",
        Role::Bishop => "bishop",
        Role::Rook => "rook",
        Role::Queen => "queen",
        Role::King => "king",
    }
}

fn chebyshev(a: Square, b: Square) -> u32 {
    let df = u32::from(a.file()).abs_diff(u32::from(b.file()));
    let dr = u32::from(a.rank()).abs_diff(u32::from(b.rank()));
    df.max(dr)
}

fn is_slider(role: Role) -> bool {
    matches!(role, Role::Bishop | Role::Rook | Role::Queen)
}

/// Slider can travel the line `a`-`b` (orthogonal for rooks, diagonal for
/// bishops, either for queens).
fn slider_covers_line(role: Role, a: Square, b: Square) -> bool {
    let orthogonal = a.file() == b.file() || a.rank() == b.rank();
    match role {
        Role::Rook => orthogonal,
        Role::Bishop => !orthogonal,
        Role::Queen => true,
        _ => false,
    }
}

/// First occupied square on the ray from `origin` strictly beyond `through`.
fn first_piece_behind(pos: &Chess, origin: Square, through: Square) -> Option<Square> {
    let ray = attacks::ray(origin, through);
    if ray.is_empty() {
        return None;
    }
    let occupied = pos.board().occupied();
    let mut candidates: Vec<Square> = ray
        .into_iter()
        .filter(|&sq| {
            sq != origin
                && sq != through
                && attacks::between(origin, sq).contains(through)
                && chebyshev(origin, sq) > chebyshev(origin, through)
        })
        .collect();
    candidates.sort_by_key(|&sq| chebyshev(origin, sq));
    candidates.into_iter().find(|&sq| occupied.contains(sq))
}

/// Enemy pieces attacked from `attacker_sq`, with their squares and values.
fn attacked_enemy_pieces(
    pos: &Chess,
    attacker_sq: Square,
    attacker_color: Color,
) -> Vec<(Square, Role, i32)> {
    let board = pos.board();
    let piece = match board.piece_at(attacker_sq) {
        Some(piece) => piece,
        None => return Vec::new(),
    };
    let targets = attacks::attacks(attacker_sq, piece, board.occupied())
        & board.by_color(!attacker_color);
    targets
        .into_iter()
        .filter_map(|sq| {
            board
                .piece_at(sq)
                .map(|p| (sq, p.role, piece_value(p.role)))
        })
        .collect()
}

/// Detect whether a move creates a fork: the moved piece attacks two or
/// more enemy pieces each worth at least the attacker (the king always
/// counts).
pub fn detect_fork(pos: &Chess, m: &Move) -> Option<TacticalMotif> {
    let from = m.from()?;
    let mover = pos.board().piece_at(from)?;
    let mut after = pos.clone();
    after.play_unchecked(m);

    let attacker_value = piece_value(m.promotion().unwrap_or(mover.role));
    let targets: Vec<(Square, Role, i32)> = attacked_enemy_pieces(&after, m.to(), mover.color)
        .into_iter()
        .filter(|&(_, role, value)| value >= attacker_value || role == Role::King)
        .collect();

    if targets.len() < 2 {
        return None;
    }

    // One target escapes, so the yield is the second most valuable piece.
    let mut values: Vec<i32> = targets.iter().map(|&(_, _, v)| v).collect();
    values.sort_unstable_by(|a, b| b.cmp(a));
    let material_gain = values[1];

    let roles: Vec<Role> = targets.iter().map(|&(_, role, _)| role).collect();
    let description = if roles.contains(&Role::King) && roles.contains(&Role::Queen) {
        "Royal Fork (King + Queen)".to_string()
    } else if roles.contains(&Role::King) {
        format!("Fork with Check ({} pieces)", targets.len())
    } else {
        let names: Vec<&str> = roles.iter().take(2).map(|&r| role_name(r)).collect();
        format!("Fork ({})", names.join(" + "))
    };

    let mut squares = vec![m.to()];
    squares.extend(targets.iter().map(|&(sq, _, _)| sq));

    Some(TacticalMotif {
        pattern: TacticalPattern::Fork,
        description,
        squares,
        material_gain,
    })
}

/// Detect every pin against `color`: absolute (to the king) and relative
/// (to a more valuable piece behind on the same ray).
pub fn detect_pins(pos: &Chess, color: Color) -> Vec<TacticalMotif> {
    let board = pos.board();
    let enemy = !color;
    let mut pins = Vec::new();

    let king_sq = board.king_of(color);

    for attacker_sq in board.by_color(enemy) {
        let attacker = match board.piece_at(attacker_sq) {
            Some(p) if is_slider(p.role) => p,
            _ => continue,
        };

        // Absolute pin: exactly one of our non-king pieces between an
        // enemy slider and our king, on a line the slider covers.
        if let Some(king_sq) = king_sq {
            if slider_covers_line(attacker.role, attacker_sq, king_sq)
                && !attacks::ray(attacker_sq, king_sq).is_empty()
            {
                let blockers = attacks::between(attacker_sq, king_sq) & board.occupied();
                if let (1, Some(pinned_sq)) = (blockers.count(), blockers.first()) {
                    if let Some(pinned) = board.piece_at(pinned_sq) {
                        if pinned.color == color && pinned.role != Role::King {
                            pins.push(TacticalMotif {
                                pattern: TacticalPattern::Pin,
                                description: format!(
                                    "Absolute Pin ({} to King)",
                                    role_name(pinned.role)
                                ),
                                squares: vec![pinned_sq, attacker_sq],
                                material_gain: piece_value(pinned.role),
                            });
                        }
                    }
                }
            }
        }

        // Relative pin: attacked piece shields a more valuable piece
        // directly behind it on the attack ray.
        let attacked = attacks::attacks(attacker_sq, attacker, board.occupied())
            & board.by_color(color);
        for target_sq in attacked {
            let target = match board.piece_at(target_sq) {
                Some(p) => p,
                None => continue,
            };
            let behind_sq = match first_piece_behind(pos, attacker_sq, target_sq) {
                Some(sq) => sq,
                None => continue,
            };
            let behind = match board.piece_at(behind_sq) {
                Some(p) if p.color == color => p,
                _ => continue,
            };
            // Pins to the king were handled above.
            if behind.role == Role::King {
                continue;
            }
            if piece_value(behind.role) > piece_value(target.role) {
                let duplicate = pins.iter().any(|p: &TacticalMotif| {
                    p.squares.contains(&target_sq) && p.squares.contains(&attacker_sq)
                });
                if !duplicate {
                    pins.push(TacticalMotif {
                        pattern: TacticalPattern::Pin,
                        description: format!(
                            "Relative Pin ({} to {})",
                            role_name(target.role),
                            role_name(behind.role)
                        ),
                        squares: vec![target_sq, attacker_sq, behind_sq],
                        material_gain: piece_value(target.role),
                    });
                }
            }
        }
    }

    pins
}

/// Detect whether a move creates a skewer: a slider attacks a more
/// valuable front piece with a lesser piece behind it on the ray.
pub fn detect_skewer(pos: &Chess, m: &Move) -> Option<TacticalMotif> {
    let from = m.from()?;
    let mover = pos.board().piece_at(from)?;
    if !is_slider(m.promotion().unwrap_or(mover.role)) {
        return None;
    }

    let mut after = pos.clone();
    after.play_unchecked(m);
    let board = after.board();
    let enemy = !mover.color;

    for (front_sq, front_role, front_value) in attacked_enemy_pieces(&after, m.to(), mover.color) {
        if !matches!(front_role, Role::King | Role::Queen | Role::Rook) {
            continue;
        }
        let behind_sq = match first_piece_behind(&after, m.to(), front_sq) {
            Some(sq) => sq,
            None => continue,
        };
        let behind = match board.piece_at(behind_sq) {
            Some(p) if p.color == enemy => p,
            _ => continue,
        };
        let behind_value = piece_value(behind.role);
        // The front piece must be the more valuable one, forced to move.
        if front_value > behind_value {
            return Some(TacticalMotif {
                pattern: TacticalPattern::Skewer,
                description: format!(
                    "Skewer ({} to {})",
                    role_name(front_role),
                    role_name(behind.role)
                ),
                squares: vec![m.to(), front_sq, behind_sq],
                material_gain: behind_value,
            });
        }
    }

    None
}

/// Detect whether moving a piece reveals an attack from a slider behind it.
pub fn detect_discovered_attack(pos: &Chess, m: &Move) -> Option<TacticalMotif> {
    let from = m.from()?;
    let mover = pos.board().piece_at(from)?;
    let enemy = !mover.color;

    let mut after = pos.clone();
    after.play_unchecked(m);
    let board_before = pos.board();
    let board_after = after.board();

    for slider_sq in board_before.by_color(mover.color) {
        if slider_sq == from || slider_sq == m.to() {
            continue;
        }
        let slider = match board_before.piece_at(slider_sq) {
            Some(p) if is_slider(p.role) => p,
            _ => continue,
        };
        if attacks::ray(slider_sq, from).is_empty() {
            continue;
        }

        let attacks_before = attacks::attacks(slider_sq, slider, board_before.occupied());
        let attacks_after = attacks::attacks(slider_sq, slider, board_after.occupied());
        let new_attacks = attacks_after & !attacks_before;

        for target_sq in new_attacks & board_after.by_color(enemy) {
            let target = match board_after.piece_at(target_sq) {
                Some(p) => p,
                None => continue,
            };
            let target_value = piece_value(target.role);
            if target.role == Role::King {
                return Some(TacticalMotif {
                    pattern: TacticalPattern::DiscoveredCheck,
                    description: format!("Discovered Check (by {})", role_name(slider.role)),
                    squares: vec![slider_sq, from, target_sq],
                    material_gain: target_value,
                });
            } else if target_value >= 300 {
                return Some(TacticalMotif {
                    pattern: TacticalPattern::DiscoveredAttack,
                    description: format!("Discovered Attack on {}", role_name(target.role)),
                    squares: vec![slider_sq, from, target_sq],
                    material_gain: target_value,
                });
            }
        }
    }

    None
}

/// Detect whether a move delivers double check.
pub fn detect_double_check(pos: &Chess, m: &Move) -> Option<TacticalMotif> {
    let mut after = pos.clone();
    after.play_unchecked(m);

    let checkers = after.checkers();
    if checkers.count() < 2 {
        return None;
    }

    Some(TacticalMotif {
        pattern: TacticalPattern::DoubleCheck,
        description: "Double Check".to_string(),
        squares: checkers.into_iter().collect(),
        // Double check forces a king move; value it like a heavy threat.
        material_gain: 500,
    })
}

/// Detect whether a heavy-piece move creates a back-rank mate threat.
pub fn detect_back_rank_threat(pos: &Chess, m: &Move) -> Option<TacticalMotif> {
    let from = m.from()?;
    let mover = pos.board().piece_at(from)?;
    if !matches!(mover.role, Role::Rook | Role::Queen) {
        return None;
    }

    let mut after = pos.clone();
    after.play_unchecked(m);
    let board = after.board();
    let enemy = !mover.color;

    let king_sq = board.king_of(enemy)?;
    let back_rank = if enemy == Color::Black { 7 } else { 0 };
    if u32::from(king_sq.rank()) != back_rank || u32::from(m.to().rank()) != back_rank {
        return None;
    }
    if !after.is_check() {
        return None;
    }

    // Mate threat only if the king has no unattacked square to run to.
    // The king is lifted off the board so rays extend through its square.
    let occupied_without_king = board.occupied() ^ Bitboard::from(king_sq);
    let escape_squares = attacks::king_attacks(king_sq);
    let has_escape = escape_squares.into_iter().any(|sq| {
        if let Some(blocker) = board.piece_at(sq) {
            if blocker.color == enemy {
                return false;
            }
        }
        board
            .attacks_to(sq, mover.color, occupied_without_king)
            .is_empty()
    });

    if has_escape {
        return None;
    }

    Some(TacticalMotif {
        pattern: TacticalPattern::BackRankThreat,
        description: "Back Rank Mate Threat".to_string(),
        squares: vec![m.to(), king_sq],
        material_gain: 10_000,
    })
}

/// Detect pieces of `color` that are attacked and have no defender.
pub fn detect_hanging_pieces(pos: &Chess, color: Color) -> Vec<TacticalMotif> {
    let board = pos.board();
    let enemy = !color;
    let mut hanging = Vec::new();

    for sq in board.by_color(color) {
        let piece = match board.piece_at(sq) {
            Some(p) if p.role != Role::King => p,
            _ => continue,
        };
        if board.attacks_to(sq, enemy, board.occupied()).is_empty() {
            continue;
        }
        if board.attacks_to(sq, color, board.occupied()).is_empty() {
            hanging.push(TacticalMotif {
                pattern: TacticalPattern::HangingPiece,
                description: format!("Hanging {}", role_name(piece.role)),
                squares: vec![sq],
                material_gain: piece_value(piece.role),
            });
        }
    }

    hanging
}

/// Detect whether capturing with this move eliminates the sole defender of
/// another enemy piece.
pub fn detect_removal_of_defender(pos: &Chess, m: &Move) -> Option<TacticalMotif> {
    if !m.is_capture() {
        return None;
    }
    let from = m.from()?;
    let mover = pos.board().piece_at(from)?;
    let enemy = !mover.color;
    let captured_sq = m.to();
    let captured = pos.board().piece_at(captured_sq)?;

    let board_before = pos.board();
    let mut after = pos.clone();
    after.play_unchecked(m);
    let board_after = after.board();

    for victim_sq in board_after.by_color(enemy) {
        let victim = match board_after.piece_at(victim_sq) {
            Some(p) if p.role != Role::King => p,
            _ => continue,
        };
        let defenders_before =
            board_before.attacks_to(victim_sq, enemy, board_before.occupied());
        if defenders_before != Bitboard::from(captured_sq) {
            continue;
        }
        let attacked_after = !board_after
            .attacks_to(victim_sq, mover.color, board_after.occupied())
            .is_empty();
        let defended_after = !board_after
            .attacks_to(victim_sq, enemy, board_after.occupied())
            .is_empty();
        if attacked_after && !defended_after {
            return Some(TacticalMotif {
                pattern: TacticalPattern::RemovalOfDefender,
                description: format!(
                    "Removal of Defender ({} defended {})",
                    role_name(captured.role),
                    role_name(victim.role)
                ),
                squares: vec![captured_sq, victim_sq],
                material_gain: piece_value(victim.role),
            });
        }
    }

    None
}

/// Detect pieces of `color` defending two or more attacked pieces that
/// have no other defender.
pub fn detect_overloaded_pieces(pos: &Chess, color: Color) -> Vec<TacticalMotif> {
    let board = pos.board();
    let enemy = !color;
    let mut overloaded = Vec::new();

    for defender_sq in board.by_color(color) {
        let mut protected: Vec<(Square, i32)> = Vec::new();
        for sq in board.by_color(color) {
            if sq == defender_sq {
                continue;
            }
            let piece = match board.piece_at(sq) {
                Some(p) if p.role != Role::King => p,
                _ => continue,
            };
            if board.attacks_to(sq, enemy, board.occupied()).is_empty() {
                continue;
            }
            let defenders = board.attacks_to(sq, color, board.occupied());
            if defenders == Bitboard::from(defender_sq) {
                protected.push((sq, piece_value(piece.role)));
            }
        }
        if protected.len() >= 2 {
            let defender = board.piece_at(defender_sq).map(|p| p.role);
            let min_gain = protected.iter().map(|&(_, v)| v).min().unwrap_or(0);
            overloaded.push(TacticalMotif {
                pattern: TacticalPattern::OverloadedPiece,
                description: format!(
                    "Overloaded {}",
                    defender.map(role_name).unwrap_or("piece")
                ),
                squares: std::iter::once(defender_sq)
                    .chain(protected.iter().map(|&(sq, _)| sq))
                    .collect(),
                material_gain: min_gain,
            });
        }
    }

    overloaded
}

/// What tactic does this move exploit? Returns the highest-yield motif.
pub fn analyze_move_tactics(pos: &Chess, m: &Move) -> Option<TacticalMotif> {
    let mut tactics = Vec::new();
    tactics.extend(detect_fork(pos, m));
    tactics.extend(detect_skewer(pos, m));
    tactics.extend(detect_discovered_attack(pos, m));
    tactics.extend(detect_double_check(pos, m));
    tactics.extend(detect_back_rank_threat(pos, m));
    tactics.extend(detect_removal_of_defender(pos, m));
    tactics.into_iter().max_by_key(|t| t.material_gain)
}

/// Structural weaknesses in `color`'s position: hangs, pins, overloads.
pub fn analyze_position_weaknesses(pos: &Chess, color: Color) -> Vec<TacticalMotif> {
    let mut weaknesses = detect_hanging_pieces(pos, color);
    weaknesses.extend(detect_pins(pos, color));
    weaknesses.extend(detect_overloaded_pieces(pos, color));
    weaknesses
}

/// Explain a blunder: what did the best move exploit, and what does the
/// position allow the opponent after the move actually played?
pub fn classify_blunder_tactics(
    pos_before: &Chess,
    blunder_move: &Move,
    best_move: Option<&Move>,
    opponent_reply: Option<&Move>,
) -> BlunderTactics {
    let mut result = BlunderTactics::default();
    let mut reasons = Vec::new();

    if let Some(best) = best_move {
        if let Some(missed) = analyze_move_tactics(pos_before, best) {
            reasons.push(format!("Missed {}", missed.description.to_lowercase()));
            result.missed_tactic = Some(missed);
        }
    }

    let player = pos_before.turn();
    let mut after_blunder = pos_before.clone();
    after_blunder.play_unchecked(blunder_move);

    if let Some(reply) = opponent_reply {
        if let Some(allowed) = analyze_move_tactics(&after_blunder, reply) {
            reasons.push(format!("Allowed {}", allowed.description.to_lowercase()));
            result.allowed_tactic = Some(allowed);
        }
    } else {
        let weaknesses = analyze_position_weaknesses(&after_blunder, player);
        if let Some(worst) = weaknesses.into_iter().max_by_key(|w| w.material_gain) {
            reasons.push(format!("Created {}", worst.description.to_lowercase()));
            result.allowed_tactic = Some(worst);
        }
    }

    result.blunder_reason = if reasons.is_empty() {
        "Positional error or deep tactical oversight".to_string()
    } else {
        reasons.join("; ")
    };

    result
}
