//! Error types for the engine protocol layer.
//!
//! Orchestration code uses [`anyhow`]; the session layer reports a typed [`SessionError`] so
//! the game runner can pick the right adjudication reason.

use std::{path::PathBuf, time::Duration};

/// Failure of an [`EngineSession`](crate::session::EngineSession).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The executable could not be launched.
    #[error("could not spawn engine '{}': {source}", path.display())]
    Spawn {
        /// Path of the executable.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Malformed or missing output (e.g. no `uciok` within the startup timeout).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// No best move within the allotted time.
    #[error("engine did not answer within {0:?}")]
    ReadTimeout(Duration),
    /// Writing to the engine's stdin failed (broken pipe).
    #[error("could not write to engine: {0}")]
    Write(#[source] std::io::Error),
}

impl SessionError {
    /// Reason string used when a game is adjudicated because of this error.
    pub fn adjudication_reason(&self) -> &'static str {
        match self {
            SessionError::Spawn { .. } => "failed to start",
            SessionError::Protocol(_) => "disconnects",
            SessionError::ReadTimeout(_) => "loses on time",
            SessionError::Write(_) => "disconnects",
        }
    }
}
