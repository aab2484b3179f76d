//! Win/draw/loss bookkeeping per pairing.
//!
//! Games finish out of order on many threads, so every pairing has its own lock and the map
//! itself is only write-locked when a pairing is seen for the first time.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    sync::{Mutex, RwLock},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Ordered pair of engine names. Statistics are kept from the first engine's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pairing {
    /// First engine.
    pub first: String,
    /// Second engine.
    pub second: String,
}

impl Pairing {
    /// Pairing of `first` against `second`.
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        Pairing {
            first: first.into(),
            second: second.into(),
        }
    }
}

impl std::fmt::Display for Pairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} vs {}", self.first, self.second)
    }
}

/// Result of one game from the pairing's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The first engine won.
    FirstWins,
    /// The second engine won.
    SecondWins,
    /// Draw.
    Draw,
}

/// Results of the first engine of a pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Games won by the first engine.
    pub wins: u64,
    /// Games lost by the first engine.
    pub losses: u64,
    /// Drawn games.
    pub draws: u64,
}

impl Stats {
    /// Total number of games.
    pub fn games(&self) -> u64 {
        self.wins + self.losses + self.draws
    }

    /// Points scored per game, in `[0, 1]`. Zero games give 0.5.
    pub fn score(&self) -> f64 {
        let n = self.games();
        if n == 0 {
            return 0.5;
        }
        (self.wins as f64 + 0.5 * self.draws as f64) / n as f64
    }

    /// Elo difference estimate and its 95% error margin.
    ///
    /// The estimate is infinite when one side scored every point.
    pub fn elo(&self) -> (f64, f64) {
        let n = self.games();
        if n == 0 {
            return (0.0, 0.0);
        }
        let n = n as f64;
        let mu = self.score();
        let deviation = |points: f64, count: u64| count as f64 / n * (points - mu).powi(2);
        let variance =
            deviation(1.0, self.wins) + deviation(0.5, self.draws) + deviation(0.0, self.losses);
        let stderr = (variance / n).sqrt();

        let low = score_to_elo((mu - 1.96 * stderr).clamp(1e-3, 1.0 - 1e-3));
        let high = score_to_elo((mu + 1.96 * stderr).clamp(1e-3, 1.0 - 1e-3));
        (score_to_elo(mu), (high - low) / 2.0)
    }

    /// Likelihood of superiority of the first engine, in `[0, 1]`.
    pub fn los(&self) -> f64 {
        let decisive = self.wins + self.losses;
        if decisive == 0 {
            return 0.5;
        }
        let z = (self.wins as f64 - self.losses as f64) / (2.0 * decisive as f64).sqrt();
        0.5 * (1.0 + erf(z))
    }

    fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::FirstWins => self.wins += 1,
            Outcome::SecondWins => self.losses += 1,
            Outcome::Draw => self.draws += 1,
        }
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (elo, margin) = self.elo();
        write!(
            f,
            "W/D/L {}/{}/{}, Elo {elo:+.1} +/- {margin:.1}, LOS {:.1}%",
            self.wins,
            self.draws,
            self.losses,
            self.los() * 100.0
        )
    }
}

fn score_to_elo(score: f64) -> f64 {
    if score <= 0.0 {
        f64::NEG_INFINITY
    } else if score >= 1.0 {
        f64::INFINITY
    } else {
        -400.0 * (1.0 / score - 1.0).log10()
    }
}

/// Error function, Abramowitz and Stegun 7.1.26 (absolute error below 1.5e-7).
fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.327_591_1 * x.abs());
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let y = 1.0 - poly * (-x * x).exp();
    y.copysign(x)
}

/// Serializable snapshot: first engine → second engine → stats.
pub type StatsMap = BTreeMap<String, BTreeMap<String, Stats>>;

/// Thread-safe results of a running tournament.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    pairings: RwLock<HashMap<Pairing, Mutex<Stats>>>,
}

impl ResultAggregator {
    /// Empty results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one finished game and returns the pairing's updated statistics.
    pub fn record(&self, pairing: &Pairing, outcome: Outcome) -> Stats {
        {
            let pairings = self.pairings.read().unwrap_or_else(|p| p.into_inner());
            if let Some(stats) = pairings.get(pairing) {
                let mut stats = stats.lock().unwrap_or_else(|p| p.into_inner());
                stats.apply(outcome);
                return *stats;
            }
        }
        let mut pairings = self.pairings.write().unwrap_or_else(|p| p.into_inner());
        let stats = pairings
            .entry(pairing.clone())
            .or_default()
            .get_mut()
            .unwrap_or_else(|p| p.into_inner());
        stats.apply(outcome);
        *stats
    }

    /// Statistics of one pairing.
    pub fn get(&self, pairing: &Pairing) -> Stats {
        let pairings = self.pairings.read().unwrap_or_else(|p| p.into_inner());
        pairings
            .get(pairing)
            .map(|s| *s.lock().unwrap_or_else(|p| p.into_inner()))
            .unwrap_or_default()
    }

    /// Copy of every pairing's statistics.
    pub fn snapshot(&self) -> StatsMap {
        let pairings = self.pairings.read().unwrap_or_else(|p| p.into_inner());
        let mut map = StatsMap::new();
        for (pairing, stats) in pairings.iter() {
            map.entry(pairing.first.clone())
                .or_default()
                .insert(pairing.second.clone(), *stats.lock().unwrap_or_else(|p| p.into_inner()));
        }
        map
    }

    /// Replaces the current statistics with `map`, e.g. when resuming a tournament.
    pub fn restore(&self, map: StatsMap) {
        let restored = map
            .into_iter()
            .flat_map(|(first, inner)| {
                inner
                    .into_iter()
                    .map(move |(second, stats)| (Pairing::new(first.clone(), second), Mutex::new(stats)))
            })
            .collect();
        *self.pairings.write().unwrap_or_else(|p| p.into_inner()) = restored;
    }

    /// Number of recorded games over all pairings.
    pub fn total_games(&self) -> u64 {
        let pairings = self.pairings.read().unwrap_or_else(|p| p.into_inner());
        pairings
            .values()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).games())
            .sum()
    }

    /// Writes the snapshot as JSON.
    ///
    /// # Errors
    ///
    /// The file cannot be written.
    pub fn save_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path, json).with_context(|| format!("could not write results to {}", path.display()))
    }

    /// Reads a snapshot written by [`save_json`](Self::save_json).
    ///
    /// # Errors
    ///
    /// The file cannot be read or is not a valid snapshot.
    pub fn load_json(path: impl AsRef<Path>) -> anyhow::Result<StatsMap> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read results from {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid results file {}", path.display()))
    }
}
