//! UCI protocol client owning one engine process.
//!
//! An [`EngineSession`] goes through
//! `NotStarted → Starting → Handshaking → Ready ⇄ AwaitingMove → … → Quitting → Dead`.
//! Any failure (process exit, broken pipe, unanswered request) moves it to `Dead`; from there
//! [`EngineSession::refresh`] may respawn it. The process is always terminated when the session
//! is dropped.
//!
//! Engine output is buffered with capture timestamps and only written to the log in bulk by
//! [`EngineSession::write_log`], so the read loop never waits on the logger.

pub mod info;

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use time::format_description::BorrowedFormatItem;
use tracing::{debug, instrument, trace, warn};

use crate::{
    engine_config::EngineConfig,
    error::SessionError,
    opening_book::{Color, STARTPOS_FEN},
    process::{EngineProcess, Line, ReadLine},
    time_control::{Clock, TimeControl},
    worker_pool::CancelToken,
};

use info::{parse_bestmove, parse_info, parse_option_name, ScoreKind, SearchInfo};

const READ_TICK: Duration = Duration::from_millis(50);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process not spawned yet.
    NotStarted,
    /// Process being spawned.
    Starting,
    /// `uci` sent, waiting for `uciok`.
    Handshaking,
    /// Idle and synchronised.
    Ready,
    /// `go` sent, waiting for `bestmove`.
    AwaitingMove,
    /// `quit` sent.
    Quitting,
    /// Process gone or unusable.
    Dead,
}

/// Answer to an `isready` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStatus {
    /// `readyok` received.
    Ready,
    /// No `readyok` in time.
    Timeout,
    /// The process is gone or could not be written to.
    Dead,
}

/// Result of waiting for a best move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `bestmove` received.
    Ok,
    /// Nothing in time.
    Timeout,
    /// The engine closed its output.
    ReadError,
}

/// Timeouts shared by every session of a tournament.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Time allowed between `uci` and `uciok`, and for the first `readyok`.
    pub startup_timeout: Duration,
    /// Time allowed for `readyok` after `ucinewgame`.
    pub ping_timeout: Duration,
    /// Time between `quit` and a forced kill.
    pub quit_grace: Duration,
    /// Forward the engine's stderr to ours.
    pub allow_stderr: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(60),
            quit_grace: Duration::from_millis(300),
            allow_stderr: false,
        }
    }
}

#[derive(Debug)]
struct LogEntry {
    outgoing: bool,
    line: Line,
}

/// Protocol client for one engine process.
#[derive(Debug)]
pub struct EngineSession {
    config: Arc<EngineConfig>,
    settings: SessionSettings,
    process: Option<EngineProcess>,
    state: SessionState,
    output: Vec<Line>,
    log: Vec<LogEntry>,
    go_sent_at: Option<Instant>,
    id_name: Option<String>,
    id_author: Option<String>,
    declared_options: HashSet<String>,
    applied_options: Vec<(String, String)>,
}

impl EngineSession {
    /// A session for `config`. Nothing is spawned until [`start`](Self::start).
    pub fn new(config: Arc<EngineConfig>, settings: SessionSettings) -> Self {
        EngineSession {
            config,
            settings,
            process: None,
            state: SessionState::NotStarted,
            output: vec![],
            log: vec![],
            go_sent_at: None,
            id_name: None,
            id_author: None,
            declared_options: HashSet::new(),
            applied_options: vec![],
        }
    }

    /// Creates, starts and handshakes a session in one go.
    pub fn launch(config: Arc<EngineConfig>, settings: SessionSettings) -> Result<Self, SessionError> {
        let mut session = Self::new(config, settings);
        session.start()?;
        session.handshake()?;
        Ok(session)
    }

    /// Spawns the engine process. Does nothing if it is already running.
    #[instrument(skip_all, fields(engine = self.config.name))]
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.process.is_some() && self.state != SessionState::Dead {
            return Ok(());
        }
        self.state = SessionState::Starting;
        let launched = EngineProcess::launch(
            &self.config.path,
            &self.config.args,
            self.config.working_dir.as_deref(),
            self.settings.allow_stderr,
        );
        match launched {
            Ok(process) => {
                debug!(pid = process.pid(), "engine started");
                self.process = Some(process);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Dead;
                Err(e)
            }
        }
    }

    /// Runs the `uci` handshake, applies the configured options and waits for `readyok`.
    #[instrument(skip_all, fields(engine = self.config.name))]
    pub fn handshake(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Handshaking;
        self.send("uci")?;

        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let read = if remaining.is_zero() {
                ReadLine::Timeout
            } else {
                self.recv(remaining)
            };
            let line = match read {
                ReadLine::Line(line) => line,
                ReadLine::Timeout => {
                    return Err(self.fail(SessionError::Protocol(format!(
                        "no uciok within {:?}",
                        self.settings.startup_timeout
                    ))))
                }
                ReadLine::Closed => {
                    return Err(self.fail(SessionError::Protocol(
                        "engine exited during handshake".to_string(),
                    )))
                }
            };
            if let Some(name) = line.text.strip_prefix("id name ") {
                self.id_name = Some(name.trim().to_string());
            } else if let Some(author) = line.text.strip_prefix("id author ") {
                self.id_author = Some(author.trim().to_string());
            } else if let Some(rest) = line.text.strip_prefix("option ") {
                if let Some(name) = parse_option_name(rest) {
                    self.declared_options.insert(name.to_ascii_lowercase());
                }
            } else if line.text.trim() == "uciok" {
                break;
            }
        }

        self.apply_options()?;

        match self.is_ready(self.settings.startup_timeout) {
            ReadyStatus::Ready => Ok(()),
            ReadyStatus::Timeout => {
                Err(self.fail(SessionError::ReadTimeout(self.settings.startup_timeout)))
            }
            ReadyStatus::Dead => Err(self.fail(SessionError::Protocol(
                "engine died after applying options".to_string(),
            ))),
        }
    }

    fn apply_options(&mut self) -> Result<(), SessionError> {
        self.applied_options.clear();
        let options = self.config.options.clone();
        for (name, value) in options {
            if !self.declared_options.is_empty()
                && !self.declared_options.contains(&name.to_ascii_lowercase())
            {
                warn!(engine = self.config.name, "engine does not declare option '{name}', skipped");
                continue;
            }
            self.send(&format!("setoption name {name} value {value}"))?;
            self.applied_options.push((name, value));
        }
        Ok(())
    }

    /// Sends `ucinewgame` followed by an `isready` probe.
    pub fn new_game(&mut self) -> ReadyStatus {
        if self.send("ucinewgame").is_err() {
            return ReadyStatus::Dead;
        }
        self.is_ready(self.settings.ping_timeout)
    }

    /// Sends `isready` and waits up to `threshold` for `readyok`.
    pub fn is_ready(&mut self, threshold: Duration) -> ReadyStatus {
        if self.send("isready").is_err() {
            return ReadyStatus::Dead;
        }
        let deadline = Instant::now() + threshold;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let read = if remaining.is_zero() {
                ReadLine::Timeout
            } else {
                self.recv(remaining)
            };
            match read {
                ReadLine::Line(line) if line.text.trim() == "readyok" => {
                    self.state = SessionState::Ready;
                    return ReadyStatus::Ready;
                }
                ReadLine::Line(_) => continue,
                ReadLine::Timeout => {
                    warn!(engine = self.config.name, "engine did not answer isready within {threshold:?}");
                    self.state = SessionState::Dead;
                    return ReadyStatus::Timeout;
                }
                ReadLine::Closed => {
                    self.state = SessionState::Dead;
                    return ReadyStatus::Dead;
                }
            }
        }
    }

    /// Sends the `position` command. Returns `false` if the write failed.
    pub fn set_position(&mut self, moves: &[String], fen: &str) -> bool {
        let mut cmd = if fen == STARTPOS_FEN {
            "position startpos".to_string()
        } else {
            format!("position fen {fen}")
        };
        if !moves.is_empty() {
            cmd.push_str(" moves ");
            cmd.push_str(&moves.join(" "));
        }
        self.send(&cmd).is_ok()
    }

    /// Sends the `go` command built from both clocks. Returns `false` if the write failed.
    pub fn go(&mut self, own: &Clock, opponent: &Clock, side_to_move: Color) -> bool {
        let cmd = go_command(own, opponent, side_to_move, self.config.nodes, self.config.depth);
        if self.send(&cmd).is_err() {
            return false;
        }
        self.go_sent_at = Some(Instant::now());
        self.state = SessionState::AwaitingMove;
        true
    }

    /// Reads engine output until `bestmove` or until `timeout` elapses.
    ///
    /// The deadline and the cancel token are checked before every read. Once the token is set,
    /// `stop` is sent once.
    pub fn read_until_bestmove(&mut self, timeout: Duration, cancel: &CancelToken) -> ReadStatus {
        self.output.clear();
        let deadline = Instant::now() + timeout;
        let mut stop_sent = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.state = SessionState::Dead;
                return ReadStatus::Timeout;
            }
            if cancel.is_cancelled() && !stop_sent {
                stop_sent = true;
                if self.send("stop").is_err() {
                    return ReadStatus::ReadError;
                }
            }
            match self.recv(remaining.min(READ_TICK)) {
                ReadLine::Line(line) => {
                    let done = line.text.starts_with("bestmove");
                    self.output.push(line);
                    if done {
                        self.state = SessionState::Ready;
                        return ReadStatus::Ok;
                    }
                }
                ReadLine::Timeout => {}
                ReadLine::Closed => {
                    self.state = SessionState::Dead;
                    return ReadStatus::ReadError;
                }
            }
        }
    }

    /// Sends `quit` and terminates the process after the grace period.
    pub fn quit(&mut self) {
        if let Some(mut process) = self.process.take() {
            self.state = SessionState::Quitting;
            process.terminate(self.settings.quit_grace);
        }
        self.state = SessionState::Dead;
    }

    /// Brings a dead session back: respawns the process and replays the handshake and options.
    ///
    /// Returns `true` if the session is `Ready` afterwards.
    pub fn refresh(&mut self) -> bool {
        if self.state == SessionState::Ready && self.is_alive() {
            return true;
        }
        self.quit();
        self.declared_options.clear();
        self.id_name = None;
        self.id_author = None;
        let restarted = self.start().and_then(|_| self.handshake());
        if let Err(e) = &restarted {
            warn!(engine = self.config.name, "could not restart engine: {e}");
        }
        restarted.is_ok()
    }

    /// Restricts the engine process to `cores`.
    ///
    /// # Errors
    ///
    /// The session has no process, or pinning is unsupported.
    pub fn pin(&mut self, cores: &[usize]) -> anyhow::Result<()> {
        match &mut self.process {
            Some(process) => process.pin(cores),
            None => anyhow::bail!("engine '{}' is not running", self.config.name),
        }
    }

    /// Replays the buffered protocol traffic through the logger and clears it.
    pub fn write_log(&mut self) {
        let format: Vec<BorrowedFormatItem<'_>> =
            time::format_description::parse("[hour]:[minute]:[second].[subsecond digits:6]")
                .unwrap_or_default();
        for entry in self.log.drain(..) {
            let stamp = entry
                .line
                .wall
                .format(&format)
                .unwrap_or_else(|_| "??".to_string());
            let arrow = if entry.outgoing { "<---" } else { "--->" };
            trace!(engine = self.config.name, "[{stamp}] {arrow} {}", entry.line.text);
        }
    }

    /// True while the process is running and the session is usable.
    pub fn is_alive(&mut self) -> bool {
        self.state != SessionState::Dead
            && self.process.as_mut().is_some_and(EngineProcess::is_alive)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Configuration this session was started from.
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// `id name` announced during the handshake.
    pub fn id_name(&self) -> Option<&str> {
        self.id_name.as_deref()
    }

    /// `id author` announced during the handshake.
    pub fn id_author(&self) -> Option<&str> {
        self.id_author.as_deref()
    }

    /// Options that were actually sent with `setoption`.
    pub fn applied_options(&self) -> &[(String, String)] {
        &self.applied_options
    }

    /// Output captured by the last [`read_until_bestmove`](Self::read_until_bestmove).
    pub fn output(&self) -> &[Line] {
        &self.output
    }

    /// Move of the last `bestmove` line.
    pub fn bestmove(&self) -> Option<String> {
        self.output
            .iter()
            .rev()
            .find_map(|line| parse_bestmove(&line.text))
            .map(|(mv, _)| mv)
    }

    /// Ponder move of the last `bestmove` line.
    pub fn ponder_move(&self) -> Option<String> {
        self.output
            .iter()
            .rev()
            .find_map(|line| parse_bestmove(&line.text))
            .and_then(|(_, ponder)| ponder)
    }

    /// Last `info` line of the primary variation that carries a score.
    pub fn last_info(&self) -> Option<SearchInfo> {
        self.output
            .iter()
            .rev()
            .filter_map(|line| parse_info(&line.text))
            .find(|info| info.score_kind != ScoreKind::Err)
    }

    /// Kind of the last reported score. Check this before interpreting [`last_score`](Self::last_score).
    pub fn last_score_kind(&self) -> ScoreKind {
        self.last_info().map(|i| i.score_kind).unwrap_or_default()
    }

    /// Raw last score: centipawns, or the signed mate distance for mate scores.
    pub fn last_score(&self) -> i32 {
        self.last_info().map(|i| i.score).unwrap_or(0)
    }

    /// Depth of the last scored `info` line.
    pub fn last_depth(&self) -> Option<u32> {
        self.last_info().and_then(|i| i.depth)
    }

    /// Node count of the last scored `info` line.
    pub fn last_nodes(&self) -> Option<u64> {
        self.last_info().and_then(|i| i.nodes)
    }

    /// Principal variation of the last scored `info` line.
    pub fn last_pv(&self) -> Vec<String> {
        self.last_info().map(|i| i.pv).unwrap_or_default()
    }

    /// Wall time between the last `go` and the `bestmove` that answered it.
    pub fn last_time(&self) -> Duration {
        let Some(sent) = self.go_sent_at else {
            return Duration::ZERO;
        };
        self.output
            .iter()
            .rev()
            .find(|line| line.text.starts_with("bestmove"))
            .map(|line| line.captured.saturating_duration_since(sent))
            .unwrap_or_else(|| sent.elapsed())
    }

    fn send(&mut self, cmd: &str) -> Result<(), SessionError> {
        let Some(process) = self.process.as_mut() else {
            self.state = SessionState::Dead;
            return Err(SessionError::Write(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "engine is not running",
            )));
        };
        let written = process.write_line(cmd);
        self.log.push(LogEntry {
            outgoing: true,
            line: Line {
                text: cmd.to_string(),
                captured: Instant::now(),
                wall: time::OffsetDateTime::now_utc(),
            },
        });
        written.map_err(|e| {
            self.state = SessionState::Dead;
            SessionError::Write(e)
        })
    }

    fn recv(&mut self, timeout: Duration) -> ReadLine {
        let Some(process) = self.process.as_ref() else {
            return ReadLine::Closed;
        };
        let read = process.read_line(timeout);
        if let ReadLine::Line(line) = &read {
            self.log.push(LogEntry {
                outgoing: false,
                line: line.clone(),
            });
        }
        read
    }

    fn fail(&mut self, error: SessionError) -> SessionError {
        self.state = SessionState::Dead;
        error
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.quit();
    }
}

/// Builds the `go` command for the side to move.
pub(crate) fn go_command(
    own: &Clock,
    opponent: &Clock,
    side_to_move: Color,
    nodes: Option<u64>,
    depth: Option<u32>,
) -> String {
    let mut cmd = String::from("go");
    match own.time_control() {
        TimeControl::FixedTime { move_time } => {
            cmd.push_str(&format!(" movetime {}", move_time.as_millis()));
        }
        TimeControl::Increment { .. } => {
            let (white, black) = match side_to_move {
                Color::White => (own, opponent),
                Color::Black => (opponent, own),
            };
            cmd.push_str(&format!(
                " wtime {} btime {}",
                white.remaining_ms(),
                black.remaining_ms()
            ));
            if white.increment_ms() > 0 {
                cmd.push_str(&format!(" winc {}", white.increment_ms()));
            }
            if black.increment_ms() > 0 {
                cmd.push_str(&format!(" binc {}", black.increment_ms()));
            }
            if let Some(mtg) = own.moves_left() {
                cmd.push_str(&format!(" movestogo {mtg}"));
            }
        }
    }
    if let Some(nodes) = nodes {
        cmd.push_str(&format!(" nodes {nodes}"));
    }
    if let Some(depth) = depth {
        cmd.push_str(&format!(" depth {depth}"));
    }
    cmd
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[test]
    fn go_command_for_increment_uses_side_to_move() {
        let own = Clock::new(
            TimeControl::increment(Duration::from_millis(5_000), Duration::from_millis(50)),
            Duration::ZERO,
        );
        let opp = Clock::new(
            TimeControl::increment(Duration::from_millis(3_000), Duration::ZERO),
            Duration::ZERO,
        );
        assert_eq!(
            go_command(&own, &opp, Color::Black, None, None),
            "go wtime 3000 btime 5000 binc 50"
        );
        assert_eq!(
            go_command(&own, &opp, Color::White, Some(1000), Some(7)),
            "go wtime 5000 btime 3000 winc 50 nodes 1000 depth 7"
        );
    }

    #[test]
    fn go_command_for_fixed_time_and_moves_to_go() {
        let fixed = Clock::new(TimeControl::fixed(Duration::from_millis(250)), Duration::ZERO);
        assert_eq!(go_command(&fixed, &fixed, Color::White, None, None), "go movetime 250");

        let mtg = Clock::new(
            TimeControl::Increment {
                base: Duration::from_secs(60),
                increment: Duration::ZERO,
                moves_to_go: Some(40),
            },
            Duration::ZERO,
        );
        assert_eq!(
            go_command(&mtg, &mtg, Color::White, None, None),
            "go wtime 60000 btime 60000 movestogo 40"
        );
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let config = EngineConfig::builder("ghost", "/nonexistent/engine-arena-ghost")
            .build()
            .unwrap();
        let mut session = EngineSession::new(Arc::new(config), SessionSettings::default());
        let err = session.start().unwrap_err();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert_eq!(session.state(), SessionState::Dead);
        assert!(!session.is_alive());
    }

    #[test]
    fn accessors_on_a_fresh_session() {
        let config = EngineConfig::builder("idle", "/bin/true").build().unwrap();
        let session = EngineSession::new(Arc::new(config), SessionSettings::default());
        assert_eq!(session.state(), SessionState::NotStarted);
        assert_eq!(session.last_score_kind(), ScoreKind::Err);
        assert_eq!(session.bestmove(), None);
        assert_eq!(session.last_time(), Duration::ZERO);
    }

    #[test]
    fn refresh_forgets_the_previous_engine_identity() {
        let config = EngineConfig::builder("gone", "/nonexistent/engine-arena-gone")
            .build()
            .unwrap();
        let mut session = EngineSession::new(Arc::new(config), SessionSettings::default());
        session.id_name = Some("Old Engine 1.0".to_string());
        session.id_author = Some("someone".to_string());
        session.declared_options.insert("hash".to_string());

        assert!(!session.refresh());
        assert_eq!(session.id_name(), None);
        assert_eq!(session.id_author(), None);
        assert!(session.declared_options.is_empty());
        assert_eq!(session.state(), SessionState::Dead);
    }
}
