//! Tournament formats and the machinery that plays their games.
//!
//! This module defines the [`Tournament`] trait and the built-in [`RoundRobin`] format.
//!
//! # Life of a game
//! [`Tournament::create`] turns the configuration into a list of [`MatchJob`]s, each with its
//! colours and opening already decided. [`Tournament::start`] checks that every engine starts,
//! then hands the jobs to a [`WorkerPool`]. A worker takes two sessions from the
//! [`EnginePool`](crate::session_pool::EnginePool), pins them if cores are available, plays the
//! game and records the result. If an SPRT is configured, it is evaluated after every game and
//! stops the tournament as soon as it reaches a decision.
//!
//! # Implementing a Custom Format
//! Implement [`Tournament`] for your own type. `create` may be called before `start` to inspect
//! the schedule; `start` calls it otherwise.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::{bail, Context};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    affinity::AffinityAllocator,
    configuration::{OpeningSourceConfig, TournamentConfig},
    engine_config::EngineConfig,
    error::SessionError,
    match_runner::{self, AdjudicationConfig, GameOutcome, GameSlot},
    opening_book::{Color, Opening, OpeningBook, OpeningSource},
    report::{GameRecord, GameResult, NullSink, ReportSink},
    results::{Outcome, Pairing, ResultAggregator, Stats, StatsMap},
    session::{EngineSession, SessionSettings},
    session_pool::{EnginePool, Pooled},
    sprt::{Sprt, SprtVerdict},
    worker_pool::{CancelToken, WorkerPool},
};

/// A tournament format.
///
/// The tournament is responsible for:
/// - Building the list of games to play
/// - Running them, possibly concurrently
/// - Exposing the results, also while running
pub trait Tournament {
    /// Builds the schedule. Returns the number of games that will be played.
    ///
    /// # Errors
    ///
    /// The opening book cannot be loaded.
    fn create(&mut self) -> anyhow::Result<usize>;

    /// Plays every scheduled game, blocking until they are done or the tournament is stopped.
    ///
    /// # Errors
    ///
    /// An engine cannot be started before the first game, or both engines of a game fail to
    /// start while the tournament runs.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Asks the running tournament to stop. Games still running end at their next move and
    /// are not recorded.
    fn stop(&self);

    /// Results so far.
    fn results(&self) -> StatsMap;
}

/// One game to play. Consumed exactly once.
#[derive(Debug, Clone)]
pub struct MatchJob {
    /// First engine of the pairing.
    pub first: Arc<EngineConfig>,
    /// Second engine of the pairing.
    pub second: Arc<EngineConfig>,
    /// Whether `first` plays white.
    pub first_is_white: bool,
    /// Starting position.
    pub opening: Opening,
    /// Position in the schedule.
    pub ordinal: usize,
    /// Round index.
    pub round: usize,
}

impl MatchJob {
    /// `(white, black)` configurations.
    pub fn colours(&self) -> (&Arc<EngineConfig>, &Arc<EngineConfig>) {
        if self.first_is_white {
            (&self.first, &self.second)
        } else {
            (&self.second, &self.first)
        }
    }

    /// Pairing the result is recorded under.
    pub fn pairing(&self) -> Pairing {
        Pairing::new(self.first.name(), self.second.name())
    }

    fn slot(&self) -> GameSlot {
        GameSlot {
            ordinal: self.ordinal,
            round: self.round,
        }
    }
}

/// Every game of a round robin, in ordinal order: `(round, first index, second index, game)`.
///
/// The engine with the lower index plays white when `round + game` is even.
pub fn round_robin_order(
    engines: usize,
    rounds: usize,
    games_per_round: usize,
) -> impl Iterator<Item = (usize, usize, usize, usize)> {
    (0..rounds).flat_map(move |round| {
        (0..engines).flat_map(move |i| {
            (i + 1..engines)
                .flat_map(move |j| (0..games_per_round).map(move |game| (round, i, j, game)))
        })
    })
}

/// SPRT state, updated together with the results it is computed from.
#[derive(Debug, Default)]
struct SprtDecision {
    verdict: SprtVerdict,
    decided_on: Option<Stats>,
}

/// State shared by the workers.
struct Shared {
    aggregator: ResultAggregator,
    pool: EnginePool,
    affinity: AffinityAllocator,
    cancel: CancelToken,
    sink: Arc<dyn ReportSink>,
    sprt: Option<Sprt>,
    decision: Mutex<SprtDecision>,
    adjudication: AdjudicationConfig,
    session: SessionSettings,
    completed: AtomicUsize,
    scheduled: AtomicUsize,
    report_interval: usize,
    verbose: bool,
    fatal: Mutex<Option<String>>,
}

/// Every engine plays every other engine `games_per_round` times per round.
///
/// Results are kept per pairing, from the point of view of the engine added first.
pub struct RoundRobin {
    config: TournamentConfig,
    jobs: Vec<MatchJob>,
    created: bool,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RoundRobin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobin")
            .field("engines", &self.config.engines.len())
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl RoundRobin {
    /// A round robin discarding game reports.
    ///
    /// # Errors
    ///
    /// The cpu list of the affinity settings cannot be parsed.
    pub fn new(config: TournamentConfig) -> anyhow::Result<Self> {
        Self::with_sink(config, Arc::new(NullSink))
    }

    /// A round robin forwarding every finished game to `sink`.
    ///
    /// # Errors
    ///
    /// The cpu list of the affinity settings cannot be parsed.
    pub fn with_sink(config: TournamentConfig, sink: Arc<dyn ReportSink>) -> anyhow::Result<Self> {
        if config.log {
            if let Err(e) = crate::logger::init_logger() {
                eprintln!("could not initialise file logging: {e:#}");
            }
        }
        let affinity = AffinityAllocator::new(&config.affinity)?;
        let shared = Shared {
            aggregator: ResultAggregator::new(),
            pool: EnginePool::new(2 * config.concurrency),
            affinity,
            cancel: CancelToken::new(),
            sink,
            sprt: config.sprt,
            decision: Mutex::new(SprtDecision::default()),
            adjudication: config.adjudication,
            session: config.session,
            completed: AtomicUsize::new(0),
            scheduled: AtomicUsize::new(0),
            report_interval: config.report_interval,
            verbose: config.verbose,
            fatal: Mutex::new(None),
        };
        Ok(RoundRobin {
            config,
            jobs: vec![],
            created: false,
            shared: Arc::new(shared),
        })
    }

    /// The scheduled games, once [`create`](Tournament::create) ran.
    pub fn jobs(&self) -> &[MatchJob] {
        &self.jobs
    }

    /// Current SPRT decision ([`SprtVerdict::Continue`] without SPRT).
    pub fn verdict(&self) -> SprtVerdict {
        self.decision().verdict
    }

    /// Results of the pairing at the moment the SPRT reached its verdict.
    pub fn verdict_stats(&self) -> Option<Stats> {
        self.decision().decided_on
    }

    fn decision(&self) -> MutexGuard<'_, SprtDecision> {
        self.shared.decision.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of recorded games, including restored ones.
    pub fn total_games(&self) -> u64 {
        self.shared.aggregator.total_games()
    }

    /// Token that stops the tournament when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    fn load_book(&self) -> anyhow::Result<OpeningBook> {
        Ok(match &self.config.opening.source {
            OpeningSourceConfig::None => OpeningBook::empty(),
            OpeningSourceConfig::EpdFile(path) => OpeningBook::from_epd_file(path)?,
            OpeningSourceConfig::Data(data) => OpeningBook::from_data(data.clone()),
        })
    }

    /// Starts and handshakes every distinct engine once, leaving the sessions in the pool.
    #[instrument(skip_all)]
    fn preflight(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for engine in &self.config.engines {
            if !seen.insert(engine.identity()) {
                continue;
            }
            let session = EngineSession::launch(engine.clone(), self.shared.session)
                .with_context(|| format!("engine '{}' failed to start", engine.name()))?;
            info!(
                engine = engine.name(),
                id_name = session.id_name().unwrap_or("?"),
                id_author = session.id_author().unwrap_or("?"),
                "engine ready"
            );
            let guard = self
                .shared
                .pool
                .acquire(engine.identity(), || Ok::<_, SessionError>(session))?;
            drop(guard);
        }
        Ok(())
    }

    fn restore_results(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.config.results_file {
            if path.exists() {
                let map = ResultAggregator::load_json(path)?;
                self.shared.aggregator.restore(map);
                info!(
                    games = self.shared.aggregator.total_games(),
                    "results restored from {}",
                    path.display()
                );
            }
        }
        Ok(())
    }

    fn save_results(&self) {
        if let Some(path) = &self.config.results_file {
            if let Err(e) = self.shared.aggregator.save_json(path) {
                error!("{e:#}");
            }
        }
    }
}

impl Tournament for RoundRobin {
    fn create(&mut self) -> anyhow::Result<usize> {
        let engines = &self.config.engines;
        let games_per_round = self.config.games_per_round;
        let initial_ordinal = self.config.initial_ordinal;
        let pairs = engines.len() * (engines.len() - 1) / 2;
        let encounters = self.config.rounds * pairs;
        let first_encounter = initial_ordinal / games_per_round;

        let mut book = self.load_book()?;
        book.prepare(
            self.config.opening.order,
            self.config.opening.seed,
            self.config.opening.start,
            first_encounter,
            encounters.saturating_sub(first_encounter),
        );

        let mut jobs = vec![];
        let mut opening = None;
        for (ordinal, (round, i, j, game)) in
            round_robin_order(engines.len(), self.config.rounds, games_per_round).enumerate()
        {
            if ordinal < initial_ordinal {
                continue;
            }
            if game == 0 || opening.is_none() {
                opening = Some(book.fetch());
            }
            let Some(opening) = opening.clone() else {
                continue;
            };
            jobs.push(MatchJob {
                first: engines[i].clone(),
                second: engines[j].clone(),
                first_is_white: (round + game) % 2 == 0,
                opening,
                ordinal,
                round,
            });
        }

        debug!(jobs = jobs.len(), "schedule created");
        self.jobs = jobs;
        self.created = true;
        self.shared.scheduled.store(self.jobs.len(), Ordering::SeqCst);
        Ok(self.jobs.len())
    }

    #[instrument(skip_all)]
    fn start(&mut self) -> anyhow::Result<()> {
        if !self.created {
            self.create()?;
        }
        self.restore_results()?;
        self.preflight()?;

        info!(
            games = self.jobs.len(),
            concurrency = self.config.concurrency,
            "tournament started"
        );
        let mut workers = WorkerPool::new(
            self.config.concurrency,
            2 * self.config.concurrency,
            self.shared.cancel.clone(),
        )?;
        for job in std::mem::take(&mut self.jobs) {
            let shared = self.shared.clone();
            if !workers.submit(move || run_job(&shared, job)) {
                debug!("tournament cancelled, no more games submitted");
                break;
            }
        }
        workers.join();
        self.created = false;

        self.save_results();
        self.shared.pool.clear();

        if let Some(reason) = self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            bail!("tournament aborted: {reason}");
        }

        for (first, inner) in self.results() {
            for (second, stats) in inner {
                info!("{first} vs {second}: {stats}");
                if self.config.verbose {
                    println!("{first} vs {second}: {stats}");
                }
            }
        }
        if self.shared.sprt.is_some() {
            info!("SPRT: {}", self.verdict());
        }
        Ok(())
    }

    fn stop(&self) {
        if self.shared.cancel.cancel() {
            info!("tournament stopped");
        }
    }

    fn results(&self) -> StatsMap {
        self.shared.aggregator.snapshot()
    }
}

fn acquire(shared: &Shared, config: &Arc<EngineConfig>) -> Result<Pooled<EngineSession>, SessionError> {
    let mut session = shared.pool.acquire(config.identity(), || {
        EngineSession::launch(config.clone(), shared.session)
    })?;
    if !session.is_alive() && !session.refresh() {
        return Err(SessionError::Protocol(format!(
            "engine '{}' could not be restarted",
            config.name()
        )));
    }
    Ok(session)
}

fn run_job(shared: &Shared, job: MatchJob) {
    if shared.cancel.is_cancelled() {
        return;
    }
    let (white_cfg, black_cfg) = job.colours();
    let white = acquire(shared, white_cfg);
    let black = acquire(shared, black_cfg);

    let (mut white, mut black) = match (white, black) {
        (Ok(white), Ok(black)) => (white, black),
        (Err(we), Err(be)) => {
            error!(ordinal = job.ordinal, "both engines failed to start: {we}; {be}");
            *shared.fatal.lock().unwrap_or_else(|p| p.into_inner()) = Some(format!(
                "'{}' and '{}' both failed to start",
                white_cfg.name(),
                black_cfg.name()
            ));
            shared.cancel.cancel();
            return;
        }
        (Err(e), Ok(_)) => return forfeit(shared, &job, Color::White, &e),
        (Ok(_), Err(e)) => return forfeit(shared, &job, Color::Black, &e),
    };

    let lease = shared
        .affinity
        .allocate(white.config().threads() + black.config().threads());
    if let Some(lease) = &lease {
        let (white_cores, black_cores) = lease.split(white.config().threads());
        for (session, cores) in [(&mut *white, white_cores), (&mut *black, black_cores)] {
            if let Err(e) = session.pin(cores) {
                shared.affinity.warn_pin_failure(&e);
            }
        }
    }

    let outcome = match_runner::play_game(
        &mut white,
        &mut black,
        &job.opening,
        job.slot(),
        &shared.adjudication,
        &shared.cancel,
    );
    drop(lease);

    match outcome {
        GameOutcome::Finished(record) => finish(shared, &job, &record),
        GameOutcome::Interrupted => debug!(ordinal = job.ordinal, "game discarded"),
    }
}

fn forfeit(shared: &Shared, job: &MatchJob, failed: Color, error: &SessionError) {
    warn!(
        ordinal = job.ordinal,
        reason = error.adjudication_reason(),
        "{error}, game forfeited by {failed}"
    );
    let (white, black) = job.colours();
    let record = match_runner::forfeit(white.name(), black.name(), failed, &job.opening, job.slot());
    finish(shared, job, &record);
}

/// Records a finished game, reports it, and runs the SPRT.
fn finish(shared: &Shared, job: &MatchJob, record: &GameRecord) {
    let outcome = match (record.result, job.first_is_white) {
        (GameResult::Draw, _) => Outcome::Draw,
        (GameResult::WhiteWins, true) | (GameResult::BlackWins, false) => Outcome::FirstWins,
        (GameResult::WhiteWins, false) | (GameResult::BlackWins, true) => Outcome::SecondWins,
    };
    let pairing = job.pairing();
    let (stats, llr) = match &shared.sprt {
        Some(sprt) => {
            // Results of an SPRT pairing are only recorded while holding the decision lock.
            let mut decision = shared.decision.lock().unwrap_or_else(|p| p.into_inner());
            let stats = shared.aggregator.record(&pairing, outcome);
            let llr = sprt.llr(stats.wins, stats.draws, stats.losses);
            if decision.verdict == SprtVerdict::Continue {
                decision.verdict = sprt.verdict_for(llr);
                if decision.verdict != SprtVerdict::Continue {
                    decision.decided_on = Some(stats);
                    if shared.cancel.cancel() {
                        let (lower, upper) = sprt.bounds();
                        info!(
                            "SPRT {} after {} games (LLR {llr:.2}, bounds [{lower:.2}, {upper:.2}])",
                            decision.verdict,
                            stats.games()
                        );
                    }
                }
            }
            (stats, Some(llr))
        }
        None => (shared.aggregator.record(&pairing, outcome), None),
    };
    shared.sink.game_finished(record);
    let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;

    let scheduled = shared.scheduled.load(Ordering::SeqCst);
    if completed % shared.report_interval == 0 || completed == scheduled {
        report_progress(shared.verbose, completed, scheduled, &pairing, &stats, llr);
    }
}

fn report_progress(
    verbose: bool,
    completed: usize,
    scheduled: usize,
    pairing: &Pairing,
    stats: &Stats,
    llr: Option<f64>,
) {
    let (elo, margin) = stats.elo();
    let llr = llr.map(|llr| format!(", LLR {llr:.2}")).unwrap_or_default();
    info!(
        completed,
        scheduled,
        "{pairing}: Elo {elo:+.1} +/- {margin:.1}, W/D/L {}/{}/{}{llr}",
        stats.wins,
        stats.draws,
        stats.losses
    );
    if verbose {
        println!(
            "[{completed}/{scheduled}] {pairing}: Elo {elo:+.1} +/- {margin:.1}, W/D/L {}/{}/{}{llr}",
            stats.wins, stats.draws, stats.losses
        );
    }
}
