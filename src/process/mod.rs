//! OS-level handling of one engine process: spawning with piped stdio, a background line
//! reader, guaranteed termination, and best-effort CPU pinning.
//!
//! On Linux, pinning places the process in a dedicated cgroup v2 whose cpuset is the
//! allocated core list. Elsewhere pinning is unsupported and only reported once.

#[cfg(target_os = "linux")]
mod process_linux;
#[cfg(target_os = "linux")]
use process_linux::Pinning;

#[cfg(not(target_os = "linux"))]
mod process_stub;
#[cfg(not(target_os = "linux"))]
use process_stub::Pinning;

use std::{
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::{Duration, Instant},
};

use time::OffsetDateTime;
use tracing::warn;

use crate::error::SessionError;

const QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One line of engine output and when it was captured.
#[derive(Debug, Clone)]
pub struct Line {
    /// Line content without the trailing newline.
    pub text: String,
    /// Monotonic capture instant, used to measure thinking time.
    pub captured: Instant,
    /// Wall-clock capture time, used when replaying logs.
    pub wall: OffsetDateTime,
}

/// Outcome of a single read attempt.
#[derive(Debug)]
pub enum ReadLine {
    /// A line arrived.
    Line(Line),
    /// Nothing arrived before the deadline.
    Timeout,
    /// The engine closed its stdout (exited or crashed).
    Closed,
}

/// A running engine process. The process is terminated when this value is dropped.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    lines: Receiver<Line>,
    pinning: Pinning,
    reaped: bool,
}

impl EngineProcess {
    /// Spawns `command` with piped stdin/stdout and starts the reader thread.
    pub fn launch(
        command: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        allow_stderr: bool,
    ) -> Result<EngineProcess, SessionError> {
        let mut cmd = Command::new(command);
        cmd.args(args).stdin(Stdio::piped()).stdout(Stdio::piped());
        if !allow_stderr {
            cmd.stderr(Stdio::null());
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        let spawn_error = |source| SessionError::Spawn {
            path: command.to_path_buf(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(std::io::Error::other("stdio was not captured")));
        };

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("engine-reader-{}", child.id()))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(text) = line else { break };
                    let line = Line {
                        text,
                        captured: Instant::now(),
                        wall: OffsetDateTime::now_utc(),
                    };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(spawn_error)?;

        Ok(EngineProcess {
            child,
            stdin: BufWriter::new(stdin),
            lines: rx,
            pinning: Pinning::default(),
            reaped: false,
        })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Writes `msg` followed by a newline and flushes.
    pub fn write_line(&mut self, msg: &str) -> std::io::Result<()> {
        self.stdin.write_all(msg.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()
    }

    /// Waits at most `timeout` for the next output line.
    pub fn read_line(&self, timeout: Duration) -> ReadLine {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => ReadLine::Line(line),
            Err(RecvTimeoutError::Timeout) => ReadLine::Timeout,
            Err(RecvTimeoutError::Disconnected) => ReadLine::Closed,
        }
    }

    /// True while the process has not exited.
    pub fn is_alive(&mut self) -> bool {
        !self.reaped && matches!(self.child.try_wait(), Ok(None))
    }

    /// Restricts the process to `cores`.
    ///
    /// # Errors
    ///
    /// Pinning is unsupported on this platform, or the cgroup could not be set up.
    pub fn pin(&mut self, cores: &[usize]) -> anyhow::Result<()> {
        let list = cores
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.pinning.pin(self.child.id(), &list)
    }

    /// Sends `quit` and kills the process if it is still running after `grace`.
    pub fn terminate(&mut self, grace: Duration) {
        if self.reaped {
            return;
        }
        let _ = self.write_line("quit");
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                self.finish_teardown();
                return;
            }
            std::thread::sleep(QUIT_POLL_INTERVAL);
        }
        if let Err(e) = self.child.kill() {
            warn!(pid = self.child.id(), "could not kill engine process: {e}");
        }
        let _ = self.child.wait();
        self.finish_teardown();
    }

    fn finish_teardown(&mut self) {
        self.reaped = true;
        self.pinning.release();
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        static CLEANUP_GRACE: Duration = Duration::from_millis(100);
        self.terminate(CLEANUP_GRACE);
    }
}
