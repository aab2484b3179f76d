//! Time controls and per-game clocks.

use std::time::Duration;

/// How much thinking time an engine gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeControl {
    /// A flat budget for every move (`go movetime`).
    FixedTime {
        /// Budget per move.
        move_time: Duration,
    },
    /// A base clock plus an increment after every move, optionally refilled every
    /// `moves_to_go` moves.
    Increment {
        /// Initial clock.
        base: Duration,
        /// Added after each move.
        increment: Duration,
        /// Number of moves until the clock is refilled with `base`.
        moves_to_go: Option<u32>,
    },
}

impl TimeControl {
    /// Fixed time per move.
    pub fn fixed(move_time: Duration) -> Self {
        TimeControl::FixedTime { move_time }
    }

    /// Base + increment, no moves-to-go.
    pub fn increment(base: Duration, increment: Duration) -> Self {
        TimeControl::Increment {
            base,
            increment,
            moves_to_go: None,
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        match *self {
            TimeControl::FixedTime { move_time } => {
                if move_time.is_zero() {
                    anyhow::bail!("fixed move time must be positive");
                }
            }
            TimeControl::Increment {
                base,
                increment,
                moves_to_go,
            } => {
                if base.is_zero() && increment.is_zero() {
                    anyhow::bail!("base time and increment cannot both be zero");
                }
                if moves_to_go == Some(0) {
                    anyhow::bail!("moves to go must be positive");
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for TimeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeControl::FixedTime { move_time } => write!(f, "{}ms/move", move_time.as_millis()),
            TimeControl::Increment {
                base,
                increment,
                moves_to_go,
            } => {
                if let Some(mtg) = moves_to_go {
                    write!(f, "{mtg}/")?;
                }
                write!(f, "{}+{}ms", base.as_millis(), increment.as_millis())
            }
        }
    }
}

/// Remaining time of one side during a game. Owned by the job playing that game.
#[derive(Debug, Clone)]
pub struct Clock {
    tc: TimeControl,
    margin: Duration,
    remaining_ms: i64,
    moves_left: Option<u32>,
}

impl Clock {
    /// A fresh clock for `tc`. `margin` is the grace allowed before a time forfeit.
    pub fn new(tc: TimeControl, margin: Duration) -> Self {
        let (remaining_ms, moves_left) = match tc {
            TimeControl::FixedTime { move_time } => (millis(move_time), None),
            TimeControl::Increment {
                base, moves_to_go, ..
            } => (millis(base), moves_to_go),
        };
        Clock {
            tc,
            margin,
            remaining_ms,
            moves_left,
        }
    }

    /// The time control this clock follows.
    pub fn time_control(&self) -> &TimeControl {
        &self.tc
    }

    /// Remaining time in milliseconds (never negative).
    pub fn remaining_ms(&self) -> u64 {
        self.remaining_ms.max(0) as u64
    }

    /// Increment in milliseconds, zero for fixed time.
    pub fn increment_ms(&self) -> u64 {
        match self.tc {
            TimeControl::Increment { increment, .. } => millis(increment) as u64,
            TimeControl::FixedTime { .. } => 0,
        }
    }

    /// Moves left until the next refill, if the time control has one.
    pub fn moves_left(&self) -> Option<u32> {
        self.moves_left
    }

    /// How long to wait for a best move before declaring a time forfeit.
    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.remaining_ms()) + self.margin
    }

    /// Charges `elapsed` to the clock. Returns `false` if the side overstepped its time.
    pub fn update(&mut self, elapsed: Duration) -> bool {
        let elapsed_ms = millis(elapsed);
        let margin_ms = millis(self.margin);
        match self.tc {
            TimeControl::FixedTime { move_time } => elapsed_ms <= millis(move_time) + margin_ms,
            TimeControl::Increment {
                base,
                increment,
                moves_to_go,
            } => {
                self.remaining_ms -= elapsed_ms;
                if self.remaining_ms < -margin_ms {
                    return false;
                }
                self.remaining_ms = self.remaining_ms.max(0) + millis(increment);

                if let (Some(left), Some(mtg)) = (self.moves_left.as_mut(), moves_to_go) {
                    *left -= 1;
                    if *left == 0 {
                        *left = mtg;
                        self.remaining_ms += millis(base);
                    }
                }
                true
            }
        }
    }
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod time_control_tests {
    use super::*;

    #[test]
    fn increment_clock_charges_and_refills() {
        let tc = TimeControl::increment(Duration::from_secs(10), Duration::from_millis(100));
        let mut clock = Clock::new(tc, Duration::from_millis(50));
        assert!(clock.update(Duration::from_millis(1_000)));
        assert_eq!(clock.remaining_ms(), 9_100);
        assert_eq!(clock.move_timeout(), Duration::from_millis(9_150));
    }

    #[test]
    fn overstepping_the_margin_flags() {
        let tc = TimeControl::increment(Duration::from_millis(100), Duration::ZERO);
        let mut clock = Clock::new(tc, Duration::from_millis(20));
        assert!(clock.update(Duration::from_millis(110)));
        assert_eq!(clock.remaining_ms(), 0);

        let mut clock = Clock::new(tc, Duration::from_millis(20));
        assert!(!clock.update(Duration::from_millis(130)));
    }

    #[test]
    fn moves_to_go_refills_base() {
        let tc = TimeControl::Increment {
            base: Duration::from_millis(1_000),
            increment: Duration::ZERO,
            moves_to_go: Some(2),
        };
        let mut clock = Clock::new(tc, Duration::ZERO);
        assert!(clock.update(Duration::from_millis(300)));
        assert_eq!(clock.moves_left(), Some(1));
        assert!(clock.update(Duration::from_millis(300)));
        assert_eq!(clock.moves_left(), Some(2));
        assert_eq!(clock.remaining_ms(), 1_400);
    }

    #[test]
    fn fixed_time_checks_each_move() {
        let mut clock = Clock::new(TimeControl::fixed(Duration::from_millis(100)), Duration::from_millis(10));
        assert!(clock.update(Duration::from_millis(105)));
        assert!(!clock.update(Duration::from_millis(111)));
        assert_eq!(clock.remaining_ms(), 100);
    }

    #[test]
    fn invalid_time_controls_are_rejected() {
        assert!(TimeControl::fixed(Duration::ZERO).validate().is_err());
        assert!(TimeControl::increment(Duration::ZERO, Duration::ZERO).validate().is_err());
        assert!(TimeControl::increment(Duration::from_secs(1), Duration::ZERO).validate().is_ok());
    }
}
