//! Static description of an engine taking part in a tournament.
//!
//! An [`EngineConfig`] is built once with [`EngineConfigBuilder`] and never changes after the
//! tournament starts. Its [`EngineIdentity`] is derived from the configuration *content*, so
//! the session pool can reuse one process for every game of the same engine.
//!
//! ```
//! use std::time::Duration;
//! use engine_arena::engine_config::EngineConfig;
//! use engine_arena::time_control::TimeControl;
//!
//! let engine = EngineConfig::builder("stockfish", "/usr/bin/stockfish")
//!     .with_option("Hash", "16")
//!     .with_option("Threads", "1")
//!     .with_time_control(TimeControl::increment(Duration::from_secs(10), Duration::from_millis(100)))
//!     .build()
//!     .unwrap();
//! assert_eq!(engine.threads(), 1);
//! ```

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    path::PathBuf,
    time::Duration,
};

use anyhow::bail;

use crate::time_control::TimeControl;

/// Pooling key of an engine. Equal keys mean interchangeable processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineIdentity(pub(crate) u64);

impl std::fmt::Display for EngineIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Engine executable, UCI options and time control.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) options: Vec<(String, String)>,
    pub(crate) time_control: TimeControl,
    pub(crate) timeout_margin: Duration,
    pub(crate) nodes: Option<u64>,
    pub(crate) depth: Option<u32>,
    identity: EngineIdentity,
}

impl PartialEq for EngineConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.identity == other.identity
    }
}

impl Eq for EngineConfig {}

impl EngineConfig {
    /// Start building a configuration for the executable at `path`.
    pub fn builder(name: impl Into<String>, path: impl Into<PathBuf>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(name, path)
    }

    /// Display name, unique within a tournament.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the executable.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// UCI options, in the order they are sent.
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Time control of this engine.
    pub fn time_control(&self) -> &TimeControl {
        &self.time_control
    }

    /// Grace period before a time forfeit.
    pub fn timeout_margin(&self) -> Duration {
        self.timeout_margin
    }

    /// Pooling key derived from path, arguments, working directory and options.
    pub fn identity(&self) -> EngineIdentity {
        self.identity
    }

    /// Number of cores this engine should be pinned to (its `Threads` option, default 1).
    pub fn threads(&self) -> usize {
        self.options
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Threads"))
            .and_then(|(_, value)| value.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(1)
    }

    fn compute_identity(
        path: &PathBuf,
        args: &[String],
        working_dir: &Option<PathBuf>,
        options: &[(String, String)],
    ) -> EngineIdentity {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        args.hash(&mut hasher);
        working_dir.hash(&mut hasher);
        options.hash(&mut hasher);
        EngineIdentity(hasher.finish())
    }
}

/// Chainable builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    name: String,
    path: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    options: Vec<(String, String)>,
    time_control: TimeControl,
    timeout_margin: Duration,
    nodes: Option<u64>,
    depth: Option<u32>,
}

impl EngineConfigBuilder {
    /// Defaults: no arguments, no options, 10s+100ms, 100ms timeout margin.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: vec![],
            working_dir: None,
            options: vec![],
            time_control: TimeControl::increment(Duration::from_secs(10), Duration::from_millis(100)),
            timeout_margin: Duration::from_millis(100),
            nodes: None,
            depth: None,
        }
    }

    /// Command-line arguments passed to the executable.
    #[must_use]
    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Directory the engine process is started in.
    #[must_use]
    pub fn with_working_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
            ..self
        }
    }

    /// Adds a UCI option. Setting the same name twice keeps the last value.
    #[must_use]
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.options.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.options.push((name, value)),
        }
        self
    }

    /// Sets the time control.
    #[must_use]
    pub fn with_time_control(self, time_control: TimeControl) -> Self {
        Self {
            time_control,
            ..self
        }
    }

    /// Grace allowed past the clock before the engine forfeits on time.
    #[must_use]
    pub fn with_timeout_margin(self, margin: Duration) -> Self {
        Self {
            timeout_margin: margin,
            ..self
        }
    }

    /// Node limit appended to every `go` command.
    #[must_use]
    pub fn with_nodes(self, nodes: u64) -> Self {
        Self {
            nodes: Some(nodes),
            ..self
        }
    }

    /// Depth limit appended to every `go` command.
    #[must_use]
    pub fn with_depth(self, depth: u32) -> Self {
        Self {
            depth: Some(depth),
            ..self
        }
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Empty name or path, or an invalid time control.
    pub fn build(self) -> anyhow::Result<EngineConfig> {
        if self.name.trim().is_empty() {
            bail!("engine name cannot be empty");
        }
        if self.path.as_os_str().is_empty() {
            bail!("engine '{}' has no executable path", self.name);
        }
        self.time_control
            .validate()
            .map_err(|e| e.context(format!("invalid time control for '{}'", self.name)))?;
        if self.nodes == Some(0) || self.depth == Some(0) {
            bail!("search limits of '{}' must be positive", self.name);
        }

        let identity =
            EngineConfig::compute_identity(&self.path, &self.args, &self.working_dir, &self.options);
        Ok(EngineConfig {
            name: self.name,
            path: self.path,
            args: self.args,
            working_dir: self.working_dir,
            options: self.options,
            time_control: self.time_control,
            timeout_margin: self.timeout_margin,
            nodes: self.nodes,
            depth: self.depth,
            identity,
        })
    }
}

#[cfg(test)]
mod engine_config_tests {
    use super::*;

    #[test]
    fn identity_depends_on_content_not_name() {
        let a = EngineConfig::builder("a", "/bin/engine")
            .with_option("Hash", "16")
            .build()
            .unwrap();
        let b = EngineConfig::builder("b", "/bin/engine")
            .with_option("Hash", "16")
            .build()
            .unwrap();
        let c = EngineConfig::builder("c", "/bin/engine")
            .with_option("Hash", "32")
            .build()
            .unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
        assert_ne!(a, b);
    }

    #[test]
    fn repeated_option_keeps_last_value() {
        let cfg = EngineConfig::builder("e", "/bin/engine")
            .with_option("Threads", "2")
            .with_option("Threads", "4")
            .build()
            .unwrap();
        assert_eq!(cfg.options(), &[("Threads".to_string(), "4".to_string())]);
        assert_eq!(cfg.threads(), 4);
    }

    #[test]
    fn invalid_configs_fail_to_build() {
        assert!(EngineConfig::builder("", "/bin/engine").build().is_err());
        assert!(EngineConfig::builder("e", "").build().is_err());
        assert!(EngineConfig::builder("e", "/bin/engine")
            .with_time_control(TimeControl::fixed(Duration::ZERO))
            .build()
            .is_err());
    }
}
