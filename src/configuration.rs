//! Tournament configuration.
//!
//! A [`TournamentConfig`] is produced by [`TournamentConfigBuilder::build`], which checks every
//! value up front so that a tournament never starts with an impossible setup.
//!
//! The builder can be created programmatically with [`TournamentConfigBuilder::new()`] or from
//! environment variables with [`TournamentConfigBuilder::from_env()`]. Engines are always
//! added programmatically.
//!
//! # Environment Variables
//!
//! All values are optional. Set a flag to `"true"` (case-insensitive) to enable it.
//!
//! - `ARENA_CONCURRENCY` (usize): number of games played at the same time (default: `1`)
//! - `ARENA_ROUNDS` (usize): number of rounds (default: `1`)
//! - `ARENA_GAMES` (usize): games per pairing and round (default: `2`)
//! - `ARENA_SEED` (u64): seed used to shuffle the opening book (default: `951356066`)
//! - `ARENA_OPENING_FILE` (path): EPD opening book
//! - `ARENA_RANDOM_ORDER` (flag): shuffle the opening book (default: `false`)
//! - `ARENA_OPENING_START` (usize): 1-based index of the first opening (default: `1`)
//! - `ARENA_CPU_LIST` (string): cores to pin engines to, e.g. `"0-3,6"`
//! - `ARENA_HYPERTHREADS` (flag): pin to all logical cores instead of physical ones
//! - `ARENA_AFFINITY` (flag): enable pinning on physical cores (default: `false`)
//! - `ARENA_REPORT_INTERVAL` (usize): games between progress reports (default: `10`)
//! - `ARENA_RESULTS_FILE` (path): JSON file results are resumed from and saved to
//! - `ARENA_LOG` (flag): log to a timestamped file (default: `false`)
//! - `ARENA_VERBOSE` (flag): print progress to stdout (default: `true`)
//! - `ARENA_DEBUG_ENGINE_STDERR` (flag): forward engine stderr (default: `false`)

use std::{collections::HashSet, env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};

use crate::{
    affinity::AffinityMode,
    engine_config::EngineConfig,
    match_runner::{AdjudicationConfig, DrawAdjudication, ResignAdjudication},
    opening_book::{BookData, OrderType},
    session::SessionSettings,
    sprt::{Sprt, SprtConfig},
};

const DEFAULT_SEED: u64 = 951_356_066;

/// Where the openings come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OpeningSourceConfig {
    /// Every game starts from the initial position.
    #[default]
    None,
    /// EPD file read when the tournament is created.
    EpdFile(PathBuf),
    /// Entries already in memory.
    Data(BookData),
}

/// Opening book options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpeningConfig {
    pub(crate) source: OpeningSourceConfig,
    pub(crate) order: OrderType,
    pub(crate) start: usize,
    pub(crate) seed: u64,
}

impl Default for OpeningConfig {
    fn default() -> Self {
        OpeningConfig {
            source: OpeningSourceConfig::None,
            order: OrderType::Sequential,
            start: 1,
            seed: DEFAULT_SEED,
        }
    }
}

/// Validated tournament settings. Obtained with [`TournamentConfigBuilder`].
#[derive(Debug, Clone)]
pub struct TournamentConfig {
    pub(crate) engines: Vec<Arc<EngineConfig>>,
    pub(crate) rounds: usize,
    pub(crate) games_per_round: usize,
    pub(crate) concurrency: usize,
    pub(crate) opening: OpeningConfig,
    pub(crate) initial_ordinal: usize,
    pub(crate) sprt: Option<Sprt>,
    pub(crate) adjudication: AdjudicationConfig,
    pub(crate) affinity: AffinityMode,
    pub(crate) report_interval: usize,
    pub(crate) results_file: Option<PathBuf>,
    pub(crate) session: SessionSettings,
    pub(crate) log: bool,
    pub(crate) verbose: bool,
}

impl TournamentConfig {
    /// Creates a builder with default values.
    pub fn builder() -> TournamentConfigBuilder {
        TournamentConfigBuilder::new()
    }

    /// Participating engines, in pairing order.
    pub fn engines(&self) -> &[Arc<EngineConfig>] {
        &self.engines
    }

    /// Number of rounds.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Games per pairing and round.
    pub fn games_per_round(&self) -> usize {
        self.games_per_round
    }

    /// Number of games played at the same time.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The SPRT, if configured.
    pub fn sprt(&self) -> Option<&Sprt> {
        self.sprt.as_ref()
    }

    /// Whether logs go to a file.
    pub fn log(&self) -> bool {
        self.log
    }
}

/// Chainable builder for [`TournamentConfig`].
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// use engine_arena::prelude::*;
///
/// let a = EngineConfig::builder("a", "/usr/bin/engine-a").build().unwrap();
/// let b = EngineConfig::builder("b", "/usr/bin/engine-b").build().unwrap();
/// let config = TournamentConfig::builder()
///     .with_engine(a)
///     .with_engine(b)
///     .with_rounds(50)
///     .with_games_per_round(2)
///     .with_concurrency(4)
///     .with_sprt(SprtConfig { elo0: 0.0, elo1: 5.0, alpha: 0.05, beta: 0.05 })
///     .build()
///     .unwrap();
/// assert_eq!(config.games_per_round(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct TournamentConfigBuilder {
    engines: Vec<EngineConfig>,
    rounds: usize,
    games_per_round: usize,
    concurrency: usize,
    opening: OpeningConfig,
    initial_ordinal: usize,
    sprt: Option<SprtConfig>,
    adjudication: AdjudicationConfig,
    affinity: AffinityMode,
    report_interval: usize,
    results_file: Option<PathBuf>,
    session: SessionSettings,
    log: bool,
    verbose: bool,
}

impl Default for TournamentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TournamentConfigBuilder {
    /// Defaults: 1 round of 2 games per pairing, one game at a time, no openings, no SPRT,
    /// no adjudication, no pinning, a progress report every 10 games.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engines: vec![],
            rounds: 1,
            games_per_round: 2,
            concurrency: 1,
            opening: OpeningConfig::default(),
            initial_ordinal: 0,
            sprt: None,
            adjudication: AdjudicationConfig::default(),
            affinity: AffinityMode::Disabled,
            report_interval: 10,
            results_file: None,
            session: SessionSettings::default(),
            log: false,
            verbose: true,
        }
    }

    /// Builder configured from the `ARENA_*` environment variables (see the module
    /// documentation). Unset or unparsable variables keep their default value.
    #[must_use]
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.parse().ok()
        }

        let mut builder = Self::new();
        if let Some(n) = parse("ARENA_CONCURRENCY") {
            builder.concurrency = n;
        }
        if let Some(n) = parse("ARENA_ROUNDS") {
            builder.rounds = n;
        }
        if let Some(n) = parse("ARENA_GAMES") {
            builder.games_per_round = n;
        }
        if let Some(seed) = parse("ARENA_SEED") {
            builder.opening.seed = seed;
        }
        if let Ok(path) = env::var("ARENA_OPENING_FILE") {
            builder.opening.source = OpeningSourceConfig::EpdFile(path.into());
        }
        if get_env_flag("ARENA_RANDOM_ORDER", false) {
            builder.opening.order = OrderType::Random;
        }
        if let Some(start) = parse("ARENA_OPENING_START") {
            builder.opening.start = start;
        }
        if get_env_flag("ARENA_AFFINITY", false) {
            builder.affinity = AffinityMode::Physical;
        }
        if get_env_flag("ARENA_HYPERTHREADS", false) {
            builder.affinity = AffinityMode::Logical;
        }
        if let Ok(list) = env::var("ARENA_CPU_LIST") {
            builder.affinity = AffinityMode::List(list);
        }
        if let Some(n) = parse("ARENA_REPORT_INTERVAL") {
            builder.report_interval = n;
        }
        if let Ok(path) = env::var("ARENA_RESULTS_FILE") {
            builder.results_file = Some(path.into());
        }
        builder.log = get_env_flag("ARENA_LOG", false);
        builder.verbose = get_env_flag("ARENA_VERBOSE", true);
        builder.session.allow_stderr = get_env_flag("ARENA_DEBUG_ENGINE_STDERR", false);
        builder
    }

    /// Adds a participant. Engines are paired in the order they are added.
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engines.push(engine);
        self
    }

    /// Number of rounds.
    #[must_use]
    pub fn with_rounds(self, rounds: usize) -> Self {
        Self { rounds, ..self }
    }

    /// Games each pairing plays per round. Colours alternate between them.
    #[must_use]
    pub fn with_games_per_round(self, games_per_round: usize) -> Self {
        Self {
            games_per_round,
            ..self
        }
    }

    /// Number of games played at the same time.
    #[must_use]
    pub fn with_concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency,
            ..self
        }
    }

    /// Reads openings from an EPD file.
    #[must_use]
    pub fn with_opening_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.opening.source = OpeningSourceConfig::EpdFile(path.into());
        self
    }

    /// Uses openings already loaded in memory.
    #[must_use]
    pub fn with_openings(mut self, data: BookData) -> Self {
        self.opening.source = OpeningSourceConfig::Data(data);
        self
    }

    /// Order in which openings are played.
    #[must_use]
    pub fn with_opening_order(mut self, order: OrderType) -> Self {
        self.opening.order = order;
        self
    }

    /// 1-based index of the first opening.
    #[must_use]
    pub fn with_opening_start(mut self, start: usize) -> Self {
        self.opening.start = start;
        self
    }

    /// Seed of the opening shuffle.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.opening.seed = seed;
        self
    }

    /// Ordinal of the first game to play; earlier games are considered played.
    #[must_use]
    pub fn with_initial_ordinal(self, initial_ordinal: usize) -> Self {
        Self {
            initial_ordinal,
            ..self
        }
    }

    /// Stops the tournament early once the SPRT reaches a decision. Needs exactly two engines.
    #[must_use]
    pub fn with_sprt(self, sprt: SprtConfig) -> Self {
        Self {
            sprt: Some(sprt),
            ..self
        }
    }

    /// Resign adjudication.
    #[must_use]
    pub fn with_resign_adjudication(mut self, score: i32, move_count: u32) -> Self {
        self.adjudication.resign = Some(ResignAdjudication { score, move_count });
        self
    }

    /// Draw adjudication.
    #[must_use]
    pub fn with_draw_adjudication(mut self, move_number: u32, move_count: u32, score: i32) -> Self {
        self.adjudication.draw = Some(DrawAdjudication {
            move_number,
            move_count,
            score,
        });
        self
    }

    /// Declares a draw once the engines played `max_plies` plies.
    #[must_use]
    pub fn with_max_plies(mut self, max_plies: u32) -> Self {
        self.adjudication.max_plies = Some(max_plies);
        self
    }

    /// CPU pinning mode.
    #[must_use]
    pub fn with_affinity(self, affinity: AffinityMode) -> Self {
        Self { affinity, ..self }
    }

    /// Games between two progress reports.
    #[must_use]
    pub fn with_report_interval(self, report_interval: usize) -> Self {
        Self {
            report_interval,
            ..self
        }
    }

    /// JSON file results are resumed from (if it exists) and saved to.
    #[must_use]
    pub fn with_results_file(self, path: impl Into<PathBuf>) -> Self {
        Self {
            results_file: Some(path.into()),
            ..self
        }
    }

    /// Time allowed for the handshake of a freshly started engine.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.session.startup_timeout = timeout;
        self
    }

    /// Time allowed for `readyok` before each game.
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.session.ping_timeout = timeout;
        self
    }

    /// Time between `quit` and a forced kill.
    #[must_use]
    pub fn with_quit_grace(mut self, grace: Duration) -> Self {
        self.session.quit_grace = grace;
        self
    }

    /// Enable or disable engine stderr output (debug purposes only).
    #[must_use]
    pub fn with_debug_engine_stderr(mut self, value: bool) -> Self {
        self.session.allow_stderr = value;
        self
    }

    /// Enable or disable logging to file.
    #[must_use]
    pub fn with_log(self, log: bool) -> Self {
        Self { log, ..self }
    }

    /// Enable or disable progress output on stdout.
    #[must_use]
    pub fn with_verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Fewer than two engines, duplicate engine names, a zero count, an opening start of 0,
    /// invalid SPRT parameters, or an SPRT with more than two engines.
    pub fn build(self) -> anyhow::Result<TournamentConfig> {
        if self.engines.len() < 2 {
            bail!("a tournament needs at least 2 engines, got {}", self.engines.len());
        }
        {
            let mut names = HashSet::new();
            for engine in &self.engines {
                if !names.insert(engine.name()) {
                    bail!("engine name '{}' is used twice", engine.name());
                }
            }
        }
        if self.rounds == 0 {
            bail!("rounds must be at least 1");
        }
        if self.games_per_round == 0 {
            bail!("games per round must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.opening.start == 0 {
            bail!("opening start is 1-based and cannot be 0");
        }
        if self.report_interval == 0 {
            bail!("report interval must be at least 1");
        }
        let sprt = match self.sprt {
            Some(config) => {
                if self.engines.len() != 2 {
                    bail!("SPRT requires exactly 2 engines, got {}", self.engines.len());
                }
                Some(Sprt::new(config).context("invalid SPRT parameters")?)
            }
            None => None,
        };
        if let Some(resign) = self.adjudication.resign {
            if resign.move_count == 0 || resign.score <= 0 {
                bail!("resign adjudication needs a positive score and move count");
            }
        }
        if let Some(draw) = self.adjudication.draw {
            if draw.move_count == 0 || draw.score < 0 {
                bail!("draw adjudication needs a positive move count and a non-negative score");
            }
        }
        if self.adjudication.max_plies == Some(0) {
            bail!("max plies must be at least 1");
        }

        Ok(TournamentConfig {
            engines: self.engines.into_iter().map(Arc::new).collect(),
            rounds: self.rounds,
            games_per_round: self.games_per_round,
            concurrency: self.concurrency,
            opening: self.opening,
            initial_ordinal: self.initial_ordinal,
            sprt,
            adjudication: self.adjudication,
            affinity: self.affinity,
            report_interval: self.report_interval,
            results_file: self.results_file,
            session: self.session,
            log: self.log,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod configuration_tests {
    use super::*;

    fn engine(name: &str) -> EngineConfig {
        EngineConfig::builder(name, "/bin/engine").build().unwrap()
    }

    #[test]
    fn test_defaults_build() {
        let config = TournamentConfigBuilder::new()
            .with_engine(engine("a"))
            .with_engine(engine("b"))
            .build()
            .unwrap();
        assert_eq!(config.rounds(), 1);
        assert_eq!(config.games_per_round(), 2);
        assert_eq!(config.concurrency(), 1);
        assert!(config.sprt().is_none());
        assert_eq!(config.opening.start, 1);
    }

    #[test]
    fn test_rejects_invalid_setups() {
        let two = || {
            TournamentConfigBuilder::new()
                .with_engine(engine("a"))
                .with_engine(engine("b"))
        };
        assert!(TournamentConfigBuilder::new().with_engine(engine("a")).build().is_err());
        assert!(TournamentConfigBuilder::new()
            .with_engine(engine("a"))
            .with_engine(engine("a"))
            .build()
            .is_err());
        assert!(two().with_rounds(0).build().is_err());
        assert!(two().with_games_per_round(0).build().is_err());
        assert!(two().with_concurrency(0).build().is_err());
        assert!(two().with_opening_start(0).build().is_err());
        assert!(two()
            .with_sprt(SprtConfig {
                elo0: 5.0,
                elo1: 0.0,
                alpha: 0.05,
                beta: 0.05
            })
            .build()
            .is_err());
        assert!(two()
            .with_engine(engine("c"))
            .with_sprt(SprtConfig::default())
            .build()
            .is_err());
        assert!(two().with_resign_adjudication(0, 3).build().is_err());
    }

    #[test]
    fn test_builder_chain() {
        let config = TournamentConfigBuilder::new()
            .with_engine(engine("a"))
            .with_engine(engine("b"))
            .with_rounds(3)
            .with_games_per_round(4)
            .with_concurrency(2)
            .with_opening_order(OrderType::Random)
            .with_opening_start(5)
            .with_seed(1)
            .with_initial_ordinal(7)
            .with_max_plies(200)
            .with_ping_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(config.opening.order, OrderType::Random);
        assert_eq!(config.opening.start, 5);
        assert_eq!(config.opening.seed, 1);
        assert_eq!(config.initial_ordinal, 7);
        assert_eq!(config.adjudication.max_plies, Some(200));
        assert_eq!(config.session.ping_timeout, Duration::from_secs(5));
    }
}
