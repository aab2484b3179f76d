//! Scripted UCI engine used by the integration tests.
//!
//! It plays knight shuffles and misbehaves on request:
//!
//! - `--name NAME`: `id name` to announce
//! - `--score CP`: centipawn score reported with every move (default 0)
//! - `--mate-in N`: after N moves, answer `bestmove (none)` with `score mate 0`
//! - `--delay MS`: think this long before every move
//! - `--hang`: never answer `go` (ignores `stop` too)
//! - `--flood`: answer `go` with an `info` line every millisecond, forever
//! - `--exit-on-go`: exit as soon as a `go` arrives
//! - `--illegal`: answer `go` with a token that is not a move
//! - `--no-uciok`: never finish the handshake

use std::{
    io::{self, BufRead, Write},
    time::Duration,
};

use anyhow::Context;

#[derive(Debug, Default)]
struct Script {
    name: String,
    score: i32,
    mate_in: Option<usize>,
    delay: Duration,
    hang: bool,
    flood: bool,
    exit_on_go: bool,
    illegal: bool,
    no_uciok: bool,
}

impl Script {
    fn from_args() -> anyhow::Result<Self> {
        let mut script = Script {
            name: "dummy".to_string(),
            ..Script::default()
        };
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || args.next().with_context(|| format!("{arg} needs a value"));
            match arg.as_str() {
                "--name" => script.name = value()?,
                "--score" => script.score = value()?.parse()?,
                "--mate-in" => script.mate_in = Some(value()?.parse()?),
                "--delay" => script.delay = Duration::from_millis(value()?.parse()?),
                "--hang" => script.hang = true,
                "--flood" => script.flood = true,
                "--exit-on-go" => script.exit_on_go = true,
                "--illegal" => script.illegal = true,
                "--no-uciok" => script.no_uciok = true,
                other => anyhow::bail!("unknown argument {other}"),
            }
        }
        Ok(script)
    }
}

const WHITE_MOVES: [&str; 4] = ["g1f3", "f3g1", "b1c3", "c3b1"];
const BLACK_MOVES: [&str; 4] = ["g8f6", "f6g8", "b8c6", "c6b8"];

/// Side to move and number of moves of the last `position` command.
fn parse_position(line: &str) -> (bool, usize) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let black_to_start = match tokens.get(1) {
        Some(&"fen") => tokens.get(3) == Some(&"b"),
        _ => false,
    };
    let moves = tokens
        .iter()
        .position(|t| *t == "moves")
        .map(|i| tokens.len() - i - 1)
        .unwrap_or(0);
    let white_to_move = (moves % 2 == 0) != black_to_start;
    (white_to_move, moves)
}

fn main() -> anyhow::Result<()> {
    let script = Script::from_args()?;
    let stdin = io::stdin();
    let mut out = io::stdout().lock();
    let mut position = (true, 0usize);
    let mut played = 0usize;

    for line in stdin.lock().lines() {
        let line = line?;
        let command = line.split_whitespace().next().unwrap_or("");
        match command {
            "uci" => {
                writeln!(out, "id name {}", script.name)?;
                writeln!(out, "id author engine-arena")?;
                writeln!(out, "option name Hash type spin default 16 min 1 max 1024")?;
                writeln!(out, "option name Threads type spin default 1 min 1 max 64")?;
                if !script.no_uciok {
                    writeln!(out, "uciok")?;
                }
            }
            "isready" => writeln!(out, "readyok")?,
            "ucinewgame" => played = 0,
            "position" => position = parse_position(&line),
            "go" => {
                if script.exit_on_go {
                    return Ok(());
                }
                if script.hang {
                    out.flush()?;
                    continue;
                }
                if script.flood {
                    while writeln!(out, "info depth 1 score cp 0 nodes 1").is_ok() {
                        let _ = out.flush();
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    return Ok(());
                }
                std::thread::sleep(script.delay);
                if script.illegal {
                    writeln!(out, "bestmove xyz")?;
                } else if script.mate_in.is_some_and(|n| played >= n) {
                    writeln!(out, "info depth 1 score mate 0")?;
                    writeln!(out, "bestmove (none)")?;
                } else {
                    let (white, moves) = position;
                    let cycle = if white { WHITE_MOVES } else { BLACK_MOVES };
                    let mv = cycle[(moves / 2) % cycle.len()];
                    writeln!(
                        out,
                        "info depth 5 seldepth 7 score cp {} nodes 1234 time 1 pv {mv}",
                        script.score
                    )?;
                    writeln!(out, "bestmove {mv}")?;
                    played += 1;
                }
            }
            "quit" => return Ok(()),
            _ => {}
        }
        out.flush()?;
    }
    Ok(())
}
