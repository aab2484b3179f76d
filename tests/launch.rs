use std::{sync::Arc, time::Duration};

use engine_arena::{
    opening_book::{Color, STARTPOS_FEN},
    report::{GameResult, Termination},
    results::ResultAggregator,
    session::{info::ScoreKind, EngineSession, ReadStatus, SessionSettings, SessionState},
    session_pool::EnginePool,
    time_control::Clock,
    worker_pool::CancelToken,
};

use engine_arena::prelude::*;
use time::format_description;
use tracing::{Level, Metadata};
use tracing_subscriber::{
    fmt,
    layer::{Context, Filter, SubscriberExt},
    FmtSubscriber, Layer, Registry,
};

const DUMMY: &str = env!("CARGO_BIN_EXE_dummy-engine");

struct CustomLevelFilter;
impl<S> Filter<S> for CustomLevelFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.level() == &Level::DEBUG
    }
}

#[allow(dead_code)]
fn init_as_file_logger() {
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[allow(dead_code)]
fn init_debug_logger() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(false);

    let reg = Registry::default().with(
        fmt::layer()
            .event_format(format)
            .with_filter(CustomLevelFilter),
    );

    let _ = tracing::subscriber::set_global_default(reg);
}

fn dummy(name: &str, args: &[&str]) -> EngineConfig {
    let mut all = vec!["--name", name];
    all.extend_from_slice(args);
    EngineConfig::builder(name, DUMMY)
        .with_args(all)
        .with_option("Hash", "16")
        .with_time_control(TimeControl::fixed(Duration::from_millis(500)))
        .build()
        .unwrap()
}

#[test]
fn session_handshake_and_search() {
    let config = Arc::new(dummy("solo", &["--score", "35"]));
    let mut session = EngineSession::launch(config, SessionSettings::default()).unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.id_name(), Some("solo"));
    assert_eq!(session.id_author(), Some("engine-arena"));
    assert_eq!(
        session.applied_options(),
        &[("Hash".to_string(), "16".to_string())]
    );

    let clock = Clock::new(TimeControl::fixed(Duration::from_millis(500)), Duration::from_millis(100));
    assert!(session.set_position(&[], STARTPOS_FEN));
    assert!(session.go(&clock, &clock, Color::White));
    let status = session.read_until_bestmove(clock.move_timeout(), &CancelToken::new());
    assert_eq!(status, ReadStatus::Ok);
    assert_eq!(session.bestmove().as_deref(), Some("g1f3"));
    assert_eq!(session.last_score_kind(), ScoreKind::Cp);
    assert_eq!(session.last_score(), 35);
    assert_eq!(session.last_depth(), Some(5));
    assert_eq!(session.last_pv(), vec!["g1f3".to_string()]);

    assert!(session.set_position(&["g1f3".to_string()], STARTPOS_FEN));
    assert!(session.go(&clock, &clock, Color::Black));
    assert_eq!(
        session.read_until_bestmove(clock.move_timeout(), &CancelToken::new()),
        ReadStatus::Ok
    );
    assert_eq!(session.bestmove().as_deref(), Some("g8f6"));

    session.quit();
    assert!(!session.is_alive());
}

#[test]
fn pooled_session_is_reused() {
    let config = Arc::new(dummy("pooled", &[]));
    let pool = EnginePool::new(2);
    let launch = || EngineSession::launch(config.clone(), SessionSettings::default());

    let first = pool.acquire(config.identity(), launch).unwrap();
    assert_eq!(pool.in_use_count(), 1);
    drop(first);
    assert_eq!(pool.idle_count(), 1);

    let mut again = pool
        .acquire(config.identity(), || -> Result<EngineSession, engine_arena::error::SessionError> {
            panic!("an idle session was available")
        })
        .unwrap();
    assert!(again.is_alive());
    assert_eq!(pool.idle_count(), 0);
    drop(again);
    pool.clear();
    assert_eq!(pool.idle_count(), 0);
}

#[test]
fn timed_out_session_is_not_returned_to_the_pool() {
    let config = Arc::new(dummy("stuck", &["--hang"]));
    let pool = EnginePool::new(2);
    let mut session = pool
        .acquire(config.identity(), || {
            EngineSession::launch(config.clone(), SessionSettings::default())
        })
        .unwrap();

    let clock = Clock::new(TimeControl::fixed(Duration::from_millis(200)), Duration::from_millis(100));
    assert!(session.set_position(&[], STARTPOS_FEN));
    assert!(session.go(&clock, &clock, Color::White));
    assert_eq!(
        session.read_until_bestmove(clock.move_timeout(), &CancelToken::new()),
        ReadStatus::Timeout
    );
    assert_eq!(session.state(), SessionState::Dead);

    drop(session);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.in_use_count(), 0);
}

#[test]
fn refresh_respawns_a_dead_session() {
    let config = Arc::new(dummy("phoenix", &[]));
    let mut session = EngineSession::launch(config, SessionSettings::default()).unwrap();
    session.quit();
    assert_eq!(session.state(), SessionState::Dead);
    assert!(!session.is_alive());

    assert!(session.refresh());
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.is_alive());
    assert_eq!(session.id_name(), Some("phoenix"));
    assert_eq!(
        session.applied_options(),
        &[("Hash".to_string(), "16".to_string())]
    );

    let clock = Clock::new(TimeControl::fixed(Duration::from_millis(500)), Duration::from_millis(100));
    assert!(session.set_position(&[], STARTPOS_FEN));
    assert!(session.go(&clock, &clock, Color::White));
    assert_eq!(
        session.read_until_bestmove(clock.move_timeout(), &CancelToken::new()),
        ReadStatus::Ok
    );
    assert_eq!(session.bestmove().as_deref(), Some("g1f3"));
}

#[test]
fn output_flood_does_not_extend_the_deadline() {
    let config = Arc::new(dummy("chatty", &["--flood"]));
    let mut session = EngineSession::launch(config, SessionSettings::default()).unwrap();
    let clock = Clock::new(TimeControl::fixed(Duration::from_millis(200)), Duration::from_millis(100));
    assert!(session.set_position(&[], STARTPOS_FEN));
    assert!(session.go(&clock, &clock, Color::White));

    let started = std::time::Instant::now();
    assert_eq!(
        session.read_until_bestmove(clock.move_timeout(), &CancelToken::new()),
        ReadStatus::Timeout
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(session.state(), SessionState::Dead);
}

#[test]
fn round_robin_with_max_plies() {
    let config = TournamentConfigBuilder::new()
        .with_verbose(false)
        .with_engine(dummy("alpha", &[]))
        .with_engine(dummy("beta", &[]))
        .with_engine(dummy("gamma", &[]))
        .with_rounds(2)
        .with_games_per_round(2)
        .with_concurrency(2)
        .with_max_plies(6)
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let mut tournament = RoundRobin::with_sink(config, sink.clone()).unwrap();
    assert_eq!(tournament.create().unwrap(), 12);
    tournament.start().unwrap();

    assert_eq!(tournament.total_games(), 12);
    let records = sink.records();
    assert_eq!(records.len(), 12);
    for record in &records {
        assert_eq!(record.result, GameResult::Draw);
        assert_eq!(record.termination, Termination::MaxPlies);
        assert_eq!(record.moves.len(), 6);
        assert!(record.loser.is_none());
    }

    let results = tournament.results();
    for (first, second) in [("alpha", "beta"), ("alpha", "gamma"), ("beta", "gamma")] {
        let stats = &results[first][second];
        assert_eq!((stats.wins, stats.draws, stats.losses), (0, 4, 0));
    }
}

#[test]
fn sprt_stops_a_one_sided_match() {
    let dir = tempfile::tempdir().unwrap();
    let results_file = dir.path().join("results.json");
    let config = TournamentConfigBuilder::new()
        .with_verbose(false)
        .with_engine(dummy("strong", &["--score", "300"]))
        .with_engine(dummy("weak", &["--mate-in", "0"]))
        .with_rounds(100)
        .with_concurrency(2)
        .with_sprt(SprtConfig {
            elo0: 0.0,
            elo1: 200.0,
            alpha: 0.05,
            beta: 0.05,
        })
        .with_results_file(&results_file)
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let mut tournament = RoundRobin::with_sink(config, sink.clone()).unwrap();
    tournament.start().unwrap();

    assert_eq!(tournament.verdict(), SprtVerdict::AcceptH1);
    let played = tournament.total_games();
    assert!((8..200).contains(&played), "played {played} games");

    let stats = tournament.results()["strong"]["weak"];
    assert_eq!(stats.wins, played);
    for record in sink.records() {
        assert_eq!(record.termination, Termination::Checkmate);
        assert_eq!(record.loser.as_deref(), Some("weak"));
    }

    let saved = ResultAggregator::load_json(&results_file).unwrap();
    assert_eq!(saved["strong"]["weak"], stats);
}

#[test]
fn hanging_engine_loses_on_time() {
    let config = TournamentConfigBuilder::new()
        .with_verbose(false)
        .with_engine(dummy("sleeper", &["--hang"]))
        .with_engine(dummy("awake", &[]))
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let mut tournament = RoundRobin::with_sink(config, sink.clone()).unwrap();
    tournament.start().unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.termination, Termination::Timeout);
        assert_eq!(record.loser.as_deref(), Some("sleeper"));
        assert!(record.termination_reason().contains("loses on time"));
    }
    assert_eq!(tournament.results()["sleeper"]["awake"].losses, 2);
}

#[test]
fn misbehaving_engines_forfeit() {
    let config = TournamentConfigBuilder::new()
        .with_verbose(false)
        .with_engine(dummy("quitter", &["--exit-on-go"]))
        .with_engine(dummy("cheater", &["--illegal"]))
        .with_engine(dummy("honest", &[]))
        .with_max_plies(10)
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let mut tournament = RoundRobin::with_sink(config, sink.clone()).unwrap();
    tournament.start().unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 6);
    for record in records.iter().filter(|r| r.white == "honest" || r.black == "honest") {
        let loser = record.loser.as_deref().unwrap();
        let expected = if loser == "quitter" {
            Termination::Disconnect
        } else {
            Termination::IllegalMove
        };
        assert_ne!(loser, "honest");
        assert_eq!(record.termination, expected);
    }
    let results = tournament.results();
    assert_eq!(results["quitter"]["honest"].losses, 2);
    assert_eq!(results["cheater"]["honest"].losses, 2);
}

#[test]
fn engine_without_uciok_fails_preflight() {
    let config = TournamentConfigBuilder::new()
        .with_verbose(false)
        .with_engine(dummy("mute", &["--no-uciok"]))
        .with_engine(dummy("fine", &[]))
        .with_startup_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let mut tournament = RoundRobin::new(config).unwrap();
    let err = tournament.start().unwrap_err();
    assert!(format!("{err:#}").contains("mute"));
    assert_eq!(tournament.total_games(), 0);
}
