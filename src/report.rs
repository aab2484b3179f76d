//! What a finished game looks like to the outside, and where it is sent.
//!
//! Formatting (PGN, EPD, ...) is left to [`ReportSink`] implementations.

use std::{sync::Mutex, time::Duration};

use crate::{opening_book::Opening, session::info::ScoreKind};

/// Final result of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    /// 1-0
    WhiteWins,
    /// 0-1
    BlackWins,
    /// 1/2-1/2
    Draw,
}

impl std::fmt::Display for GameResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GameResult::WhiteWins => "1-0",
            GameResult::BlackWins => "0-1",
            GameResult::Draw => "1/2-1/2",
        })
    }
}

/// Why a game ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The engine to move reported no legal move while being mated.
    Checkmate,
    /// The engine to move reported no legal move without being mated.
    Stalemate,
    /// The loser did not answer in time.
    Timeout,
    /// The loser exited, closed its pipes or stopped answering.
    Disconnect,
    /// The loser could not be started.
    FailedToStart,
    /// The loser sent something that is not a move.
    IllegalMove,
    /// Both engines agreed the loser is lost.
    ResignAdjudication,
    /// Both engines agreed the position is drawn.
    DrawAdjudication,
    /// The ply cap was reached.
    MaxPlies,
}

impl Termination {
    /// Human readable reason, as written in reports.
    pub fn reason(&self) -> &'static str {
        match self {
            Termination::Checkmate => "checkmate",
            Termination::Stalemate => "stalemate",
            Termination::Timeout => "loses on time",
            Termination::Disconnect => "disconnects",
            Termination::FailedToStart => "failed to start",
            Termination::IllegalMove => "illegal move",
            Termination::ResignAdjudication => "adjudication: resign",
            Termination::DrawAdjudication => "adjudication: draw",
            Termination::MaxPlies => "adjudication: max plies",
        }
    }
}

/// One move of a game with what the engine reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRecord {
    /// The move, in UCI notation.
    pub mv: String,
    /// Kind of the reported score.
    pub score_kind: ScoreKind,
    /// Raw reported score.
    pub score: i32,
    /// Reported depth.
    pub depth: Option<u32>,
    /// Reported nodes.
    pub nodes: Option<u64>,
    /// Measured thinking time.
    pub elapsed: Duration,
    /// Remaining clock after the move, in milliseconds.
    pub remaining_ms: u64,
}

/// Everything known about a finished game.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    /// Name of the white engine.
    pub white: String,
    /// Name of the black engine.
    pub black: String,
    /// Starting position.
    pub opening: Opening,
    /// Position of the game in the tournament schedule.
    pub ordinal: usize,
    /// Round the game belongs to.
    pub round: usize,
    /// Moves played by the engines, after the opening's forced moves.
    pub moves: Vec<MoveRecord>,
    /// Result.
    pub result: GameResult,
    /// Why the game ended.
    pub termination: Termination,
    /// Name of the engine the termination applies to, if any.
    pub loser: Option<String>,
}

impl GameRecord {
    /// `"<engine> <reason>"` or just the reason for draws.
    pub fn termination_reason(&self) -> String {
        match &self.loser {
            Some(name) => format!("{name} {}", self.termination.reason()),
            None => self.termination.reason().to_string(),
        }
    }
}

/// Receives every recorded game.
pub trait ReportSink: Send + Sync {
    /// Called once per completed game, from the worker that played it.
    fn game_finished(&self, record: &GameRecord);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn game_finished(&self, _record: &GameRecord) {}
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<GameRecord>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of the records received so far.
    pub fn records(&self) -> Vec<GameRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ReportSink for MemorySink {
    fn game_finished(&self, record: &GameRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}
