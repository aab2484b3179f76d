//! Plays one game between two ready sessions.
//!
//! The runner has no move generator: it trusts the engines for legality and detects the end
//! of a game from their reports (`bestmove (none)` or `0000`, mate scores), plus the
//! adjudications configured for the tournament and the clocks it keeps itself.

use tracing::{debug, trace};

use crate::{
    opening_book::{Color, Opening},
    report::{GameRecord, GameResult, MoveRecord, Termination},
    session::{info::ScoreKind, EngineSession, ReadStatus, ReadyStatus},
    time_control::Clock,
    worker_pool::CancelToken,
};

/// Resign when the losing side reports `score <= -score` for `move_count` consecutive moves
/// while its opponent reports `score >= score` for as long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResignAdjudication {
    /// Threshold in centipawns.
    pub score: i32,
    /// Consecutive moves of each side.
    pub move_count: u32,
}

/// Draw when both sides report `|score| <= score` for `move_count` consecutive plies, once
/// `move_number` full moves have been played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawAdjudication {
    /// First full move at which adjudication may happen.
    pub move_number: u32,
    /// Consecutive plies.
    pub move_count: u32,
    /// Threshold in centipawns.
    pub score: i32,
}

/// Harness-side game ending rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdjudicationConfig {
    /// Resign adjudication, off by default.
    pub resign: Option<ResignAdjudication>,
    /// Draw adjudication, off by default.
    pub draw: Option<DrawAdjudication>,
    /// Draw once this many plies have been played by the engines.
    pub max_plies: Option<u32>,
}

/// Where a game belongs in the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameSlot {
    /// Game ordinal.
    pub ordinal: usize,
    /// Round index.
    pub round: usize,
}

/// How [`play_game`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GameOutcome {
    /// The game reached a result.
    Finished(GameRecord),
    /// The tournament was stopped while the game was running. Nothing is recorded.
    Interrupted,
}

#[derive(Debug, Default)]
struct ResignTracker {
    losing: [u32; 2],
    winning: [u32; 2],
}

impl ResignTracker {
    fn update(&mut self, side: Color, kind: ScoreKind, score: i32, threshold: i32) {
        let i = index(side);
        let (lost, won) = match kind {
            ScoreKind::Cp => (score <= -threshold, score >= threshold),
            ScoreKind::Mate => (score <= 0, score > 0),
            ScoreKind::Err => (false, false),
        };
        self.losing[i] = if lost { self.losing[i] + 1 } else { 0 };
        self.winning[i] = if won { self.winning[i] + 1 } else { 0 };
    }

    fn loser(&self, move_count: u32) -> Option<Color> {
        [Color::White, Color::Black].into_iter().find(|&side| {
            self.losing[index(side)] >= move_count
                && self.winning[index(side.opposite())] >= move_count
        })
    }
}

fn index(side: Color) -> usize {
    match side {
        Color::White => 0,
        Color::Black => 1,
    }
}

enum Ply {
    Continue,
    End(GameResult, Termination, Option<Color>),
    Interrupted,
}

fn loss(side: Color, termination: Termination) -> Ply {
    let result = match side {
        Color::White => GameResult::BlackWins,
        Color::Black => GameResult::WhiteWins,
    };
    Ply::End(result, termination, Some(side))
}

/// Plays a game from `opening`. Both sessions must be `Ready`.
///
/// The cancel token is checked before each move request; a game interrupted this way is
/// reported as [`GameOutcome::Interrupted`].
pub fn play_game(
    white: &mut EngineSession,
    black: &mut EngineSession,
    opening: &Opening,
    slot: GameSlot,
    adjudication: &AdjudicationConfig,
    cancel: &CancelToken,
) -> GameOutcome {
    let white_name = white.config().name().to_string();
    let black_name = black.config().name().to_string();
    debug!(ordinal = slot.ordinal, "starting game {white_name} vs {black_name}");

    let mut game = Game {
        clocks: [
            Clock::new(*white.config().time_control(), white.config().timeout_margin()),
            Clock::new(*black.config().time_control(), black.config().timeout_margin()),
        ],
        moves: opening.moves.clone(),
        records: vec![],
        resign: ResignTracker::default(),
        draw_streak: 0,
    };

    let mut outcome = None;
    for (side, session) in [(Color::White, &mut *white), (Color::Black, &mut *black)] {
        if session.new_game() != ReadyStatus::Ready {
            outcome = Some(loss(side, Termination::Disconnect));
            break;
        }
    }

    let mut side = opening.side_to_move_after_moves();
    let outcome = loop {
        if let Some(ply) = outcome.take() {
            break ply;
        }
        if cancel.is_cancelled() {
            break Ply::Interrupted;
        }
        let session = match side {
            Color::White => &mut *white,
            Color::Black => &mut *black,
        };
        match game.play_ply(session, side, opening, adjudication, cancel) {
            Ply::Continue => side = side.opposite(),
            other => outcome = Some(other),
        }
    };

    white.write_log();
    black.write_log();

    match outcome {
        Ply::Interrupted | Ply::Continue => {
            debug!(ordinal = slot.ordinal, "game interrupted");
            GameOutcome::Interrupted
        }
        Ply::End(result, termination, loser) => {
            let loser = loser.map(|side| match side {
                Color::White => white_name.clone(),
                Color::Black => black_name.clone(),
            });
            let record = GameRecord {
                white: white_name,
                black: black_name,
                opening: opening.clone(),
                ordinal: slot.ordinal,
                round: slot.round,
                moves: game.records,
                result,
                termination,
                loser,
            };
            debug!(
                ordinal = slot.ordinal,
                "game finished {} ({})",
                record.result,
                record.termination_reason()
            );
            GameOutcome::Finished(record)
        }
    }
}

/// Record of a game that could not be played because one side failed to start.
pub fn forfeit(
    white: &str,
    black: &str,
    failed: Color,
    opening: &Opening,
    slot: GameSlot,
) -> GameRecord {
    let (result, loser) = match failed {
        Color::White => (GameResult::BlackWins, white),
        Color::Black => (GameResult::WhiteWins, black),
    };
    GameRecord {
        white: white.to_string(),
        black: black.to_string(),
        opening: opening.clone(),
        ordinal: slot.ordinal,
        round: slot.round,
        moves: vec![],
        result,
        termination: Termination::FailedToStart,
        loser: Some(loser.to_string()),
    }
}

struct Game {
    clocks: [Clock; 2],
    moves: Vec<String>,
    records: Vec<MoveRecord>,
    resign: ResignTracker,
    draw_streak: u32,
}

impl Game {
    fn play_ply(
        &mut self,
        session: &mut EngineSession,
        side: Color,
        opening: &Opening,
        adjudication: &AdjudicationConfig,
        cancel: &CancelToken,
    ) -> Ply {
        if let Some(max) = adjudication.max_plies {
            if self.records.len() >= max as usize {
                return Ply::End(GameResult::Draw, Termination::MaxPlies, None);
            }
        }

        let [white_clock, black_clock] = &self.clocks;
        let (own, opponent) = match side {
            Color::White => (white_clock, black_clock),
            Color::Black => (black_clock, white_clock),
        };
        if !session.set_position(&self.moves, &opening.fen) || !session.go(own, opponent, side) {
            return loss(side, Termination::Disconnect);
        }
        let timeout = own.move_timeout();

        match session.read_until_bestmove(timeout, cancel) {
            _ if cancel.is_cancelled() => return Ply::Interrupted,
            ReadStatus::Ok => {}
            ReadStatus::Timeout => return loss(side, Termination::Timeout),
            ReadStatus::ReadError => return loss(side, Termination::Disconnect),
        }

        let elapsed = session.last_time();
        if !self.clocks[index(side)].update(elapsed) {
            return loss(side, Termination::Timeout);
        }

        let score_kind = session.last_score_kind();
        let score = session.last_score();
        let Some(mv) = session.bestmove() else {
            return loss(side, Termination::IllegalMove);
        };
        if mv == "(none)" || mv == "0000" {
            return if score_kind == ScoreKind::Mate && score <= 0 {
                loss(side, Termination::Checkmate)
            } else {
                Ply::End(GameResult::Draw, Termination::Stalemate, None)
            };
        }
        if !is_uci_move(&mv) {
            trace!("unparseable move '{mv}'");
            return loss(side, Termination::IllegalMove);
        }

        self.records.push(MoveRecord {
            mv: mv.clone(),
            score_kind,
            score,
            depth: session.last_depth(),
            nodes: session.last_nodes(),
            elapsed,
            remaining_ms: self.clocks[index(side)].remaining_ms(),
        });
        self.moves.push(mv);

        if let Some(resign) = adjudication.resign {
            self.resign.update(side, score_kind, score, resign.score);
            if let Some(loser) = self.resign.loser(resign.move_count) {
                return loss(loser, Termination::ResignAdjudication);
            }
        }
        if let Some(draw) = adjudication.draw {
            let full_moves = (self.records.len() / 2) as u32;
            let quiet = score_kind == ScoreKind::Cp && score.abs() <= draw.score;
            self.draw_streak = if full_moves >= draw.move_number && quiet {
                self.draw_streak + 1
            } else {
                0
            };
            if self.draw_streak >= draw.move_count {
                return Ply::End(GameResult::Draw, Termination::DrawAdjudication, None);
            }
        }
        Ply::Continue
    }
}

/// Syntactic check of a long algebraic move such as `e2e4` or `a7a8q`.
pub fn is_uci_move(mv: &str) -> bool {
    let b = mv.as_bytes();
    let square = |file: u8, rank: u8| (b'a'..=b'h').contains(&file) && (b'1'..=b'8').contains(&rank);
    match b.len() {
        4 => square(b[0], b[1]) && square(b[2], b[3]),
        5 => square(b[0], b[1]) && square(b[2], b[3]) && matches!(b[4], b'q' | b'r' | b'b' | b'n'),
        _ => false,
    }
}

#[cfg(test)]
mod match_runner_tests {
    use super::*;

    #[test]
    fn test_uci_move_syntax() {
        assert!(is_uci_move("e2e4"));
        assert!(is_uci_move("a7a8q"));
        assert!(!is_uci_move("e2e9"));
        assert!(!is_uci_move("a7a8k"));
        assert!(!is_uci_move("resign"));
        assert!(!is_uci_move(""));
    }

    #[test]
    fn test_resign_needs_both_sides_to_agree() {
        let mut tracker = ResignTracker::default();
        for _ in 0..3 {
            tracker.update(Color::White, ScoreKind::Cp, -700, 600);
        }
        assert_eq!(tracker.loser(3), None);
        for _ in 0..2 {
            tracker.update(Color::Black, ScoreKind::Cp, 650, 600);
        }
        assert_eq!(tracker.loser(3), None);
        tracker.update(Color::Black, ScoreKind::Mate, 4, 600);
        assert_eq!(tracker.loser(3), Some(Color::White));

        tracker.update(Color::White, ScoreKind::Cp, 0, 600);
        assert_eq!(tracker.loser(3), None);
    }

    #[test]
    fn test_forfeit_record() {
        let slot = GameSlot { ordinal: 3, round: 1 };
        let record = forfeit("a", "b", Color::Black, &Opening::startpos(), slot);
        assert_eq!(record.result, GameResult::WhiteWins);
        assert_eq!(record.termination_reason(), "b failed to start");
        assert!(record.moves.is_empty());
    }
}
