//! Sequential probability ratio test on game outcomes.
//!
//! Outcomes are modelled with the BayesElo trinomial: the draw rate is folded into a
//! `drawelo` parameter estimated from the observed results, and each hypothesis Elo gives a
//! win/draw/loss distribution. The log-likelihood ratio of H1 over H0 is compared to the
//! Wald bounds derived from `alpha` and `beta`.

use anyhow::bail;

const MIN_PROBABILITY: f64 = 1e-12;

/// Hypotheses and error rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SprtConfig {
    /// Elo difference under H0.
    pub elo0: f64,
    /// Elo difference under H1.
    pub elo1: f64,
    /// Probability of accepting H1 when H0 holds.
    pub alpha: f64,
    /// Probability of accepting H0 when H1 holds.
    pub beta: f64,
}

impl Default for SprtConfig {
    fn default() -> Self {
        SprtConfig {
            elo0: 0.0,
            elo1: 5.0,
            alpha: 0.05,
            beta: 0.05,
        }
    }
}

/// Decision after looking at the current results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SprtVerdict {
    /// Not enough evidence yet.
    #[default]
    Continue,
    /// The results favour `elo0`.
    AcceptH0,
    /// The results favour `elo1`.
    AcceptH1,
}

impl std::fmt::Display for SprtVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SprtVerdict::Continue => "continue",
            SprtVerdict::AcceptH0 => "H0 accepted",
            SprtVerdict::AcceptH1 => "H1 accepted",
        };
        f.write_str(s)
    }
}

/// A validated test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sprt {
    config: SprtConfig,
    lower: f64,
    upper: f64,
}

impl Sprt {
    /// Validates the parameters and precomputes the bounds.
    ///
    /// # Errors
    ///
    /// `alpha` or `beta` outside `(0, 1)`, `alpha + beta >= 1`, or `elo0 >= elo1`.
    pub fn new(config: SprtConfig) -> anyhow::Result<Self> {
        let SprtConfig {
            elo0,
            elo1,
            alpha,
            beta,
        } = config;
        if !(alpha > 0.0 && alpha < 1.0) || !(beta > 0.0 && beta < 1.0) {
            bail!("SPRT alpha and beta must be between 0 and 1, got {alpha} and {beta}");
        }
        if alpha + beta >= 1.0 {
            bail!("SPRT alpha + beta must be below 1");
        }
        if !(elo0 < elo1) {
            bail!("SPRT elo0 ({elo0}) must be lower than elo1 ({elo1})");
        }
        Ok(Sprt {
            config,
            lower: (beta / (1.0 - alpha)).ln(),
            upper: ((1.0 - beta) / alpha).ln(),
        })
    }

    /// The parameters.
    pub fn config(&self) -> &SprtConfig {
        &self.config
    }

    /// `(lower, upper)` LLR bounds.
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    /// Log-likelihood ratio of H1 over H0 for the given results.
    pub fn llr(&self, wins: u64, draws: u64, losses: u64) -> f64 {
        if wins + draws + losses == 0 {
            return 0.0;
        }
        let drawelo = draw_elo(wins, draws, losses);
        let p0 = probabilities(self.config.elo0, drawelo);
        let p1 = probabilities(self.config.elo1, drawelo);

        [wins, draws, losses]
            .into_iter()
            .zip(p0.into_iter().zip(p1))
            .filter(|(count, _)| *count > 0)
            .map(|(count, (q0, q1))| {
                count as f64 * (q1.max(MIN_PROBABILITY) / q0.max(MIN_PROBABILITY)).ln()
            })
            .sum()
    }

    /// Compares the LLR of the results to the bounds.
    pub fn verdict(&self, wins: u64, draws: u64, losses: u64) -> SprtVerdict {
        self.verdict_for(self.llr(wins, draws, losses))
    }

    /// Compares an already computed LLR to the bounds.
    pub fn verdict_for(&self, llr: f64) -> SprtVerdict {
        if llr >= self.upper {
            SprtVerdict::AcceptH1
        } else if llr <= self.lower {
            SprtVerdict::AcceptH0
        } else {
            SprtVerdict::Continue
        }
    }
}

/// Draw Elo estimated from observed frequencies. Zero win or loss counts count as half a game.
pub fn draw_elo(wins: u64, draws: u64, losses: u64) -> f64 {
    let w = if wins == 0 { 0.5 } else { wins as f64 };
    let l = if losses == 0 { 0.5 } else { losses as f64 };
    let n = w + draws as f64 + l;
    let (pw, pl) = (w / n, l / n);
    200.0 * ((1.0 - pl) / pl * (1.0 - pw) / pw).log10()
}

/// `[win, draw, loss]` probabilities for an Elo difference under the BayesElo model.
fn probabilities(elo: f64, drawelo: f64) -> [f64; 3] {
    let win = 1.0 / (1.0 + 10f64.powf((drawelo - elo) / 400.0));
    let loss = 1.0 / (1.0 + 10f64.powf((drawelo + elo) / 400.0));
    [win, 1.0 - win - loss, loss]
}
