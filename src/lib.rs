//! # Engine Arena
//!
//! A modular Rust crate for running automated tournaments between UCI chess engines, with
//! early stopping through a sequential probability ratio test (SPRT).
//!
//! It provides:
//! - A UCI protocol client driving each engine process ([`session`])
//! - Reuse of running engines across games ([`session_pool`])
//! - Concurrent execution of games on a fixed set of worker threads ([`worker_pool`])
//! - Round-robin scheduling with deterministic, resumable opening allocation
//!   ([`tournament_strategy`], [`opening_book`])
//! - Result aggregation with Elo estimates and an SPRT that stops the tournament once a
//!   hypothesis is accepted ([`results`], [`sprt`])
//! - Optional CPU pinning of engine processes through Linux cgroups v2 ([`affinity`])
//!
//! Each engine runs as a separate OS process and is spoken to over its standard input and
//! output. The crate does not know the rules of chess: games end on what the engines report,
//! on the clocks kept by the harness, and on the configured adjudication rules.
//!
//! # Documentation Overview
//!
//! - For tournament settings, see [`TournamentConfigBuilder`](crate::configuration::TournamentConfigBuilder).
//! - For engine settings (executable, options, time control), see
//!   [`EngineConfig`](crate::engine_config::EngineConfig).
//! - To understand scheduling and how a game is played, see the
//!   [`Tournament`](crate::tournament_strategy::Tournament) trait and
//!   [`match_runner`].
//! - To receive every finished game (e.g. to write PGN files), implement
//!   [`ReportSink`](crate::report::ReportSink).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use engine_arena::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let tc = TimeControl::increment(Duration::from_secs(10), Duration::from_millis(100));
//!     let dev = EngineConfig::builder("dev", "./engines/dev")
//!         .with_option("Hash", "16")
//!         .with_time_control(tc)
//!         .build()?;
//!     let base = EngineConfig::builder("base", "./engines/base")
//!         .with_option("Hash", "16")
//!         .with_time_control(tc)
//!         .build()?;
//!
//!     let config = TournamentConfigBuilder::from_env()
//!         .with_engine(dev)
//!         .with_engine(base)
//!         .with_rounds(5000)
//!         .with_games_per_round(2)
//!         .with_concurrency(8)
//!         .with_opening_file("openings.epd")
//!         .with_opening_order(OrderType::Random)
//!         .with_sprt(SprtConfig { elo0: 0.0, elo1: 5.0, alpha: 0.05, beta: 0.05 })
//!         .build()?;
//!
//!     let sink = Arc::new(MemorySink::new());
//!     let mut tournament = RoundRobin::with_sink(config, sink.clone())?;
//!     tournament.start()?;
//!
//!     println!("verdict: {}", tournament.verdict());
//!     for (first, inner) in tournament.results() {
//!         for (second, stats) in inner {
//!             println!("{first} vs {second}: {stats}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Engine Requirements
//!
//! - Speak UCI on stdin/stdout: `uci`/`uciok`, `isready`/`readyok`, `position`, `go`, `stop`,
//!   `quit`
//! - Answer every `go` with a `bestmove` within the time left on its clock
//! - Report `bestmove (none)` (or `0000`) when it has no legal move, with a mate score when
//!   mated
#![warn(missing_docs)]

pub use anyhow;

pub mod affinity;
pub mod configuration;
pub mod engine_config;
pub mod error;
mod logger;
pub mod match_runner;
pub mod opening_book;
pub mod process;
pub mod report;
pub mod results;
pub mod session;
pub mod session_pool;
pub mod sprt;
pub mod time_control;
pub mod tournament_strategy;
pub mod worker_pool;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use engine_arena::prelude::*;
/// ```
///
/// Includes:
/// - [`TournamentConfig`](crate::configuration::TournamentConfig) and its builder
/// - [`EngineConfig`](crate::engine_config::EngineConfig) and
///   [`TimeControl`](crate::time_control::TimeControl)
/// - [`SprtConfig`](crate::sprt::SprtConfig)
/// - all built-in [`Tournament formats`](crate::tournament_strategy)
/// - the built-in [`report sinks`](crate::report)
pub mod prelude {
    pub use crate::affinity::AffinityMode;
    pub use crate::configuration::{TournamentConfig, TournamentConfigBuilder};
    pub use crate::engine_config::EngineConfig;
    pub use crate::opening_book::OrderType;
    pub use crate::report::{GameRecord, MemorySink, NullSink, ReportSink};
    pub use crate::sprt::{SprtConfig, SprtVerdict};
    pub use crate::time_control::TimeControl;
    pub use crate::tournament_strategy::*;
}
