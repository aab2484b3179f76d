//! Parsing of `info` and `option` lines.

/// Kind of score carried by an `info` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreKind {
    /// `score cp X`
    Cp,
    /// `score mate Y`, Y being the signed distance in moves.
    Mate,
    /// No score token.
    #[default]
    Err,
}

/// Content of one `info` line. Only the fields present in the line are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchInfo {
    /// What `score` holds.
    pub score_kind: ScoreKind,
    /// Raw score: centipawns for [`ScoreKind::Cp`], mate distance for [`ScoreKind::Mate`].
    pub score: i32,
    /// Nominal search depth.
    pub depth: Option<u32>,
    /// Selective depth.
    pub seldepth: Option<u32>,
    /// Searched nodes.
    pub nodes: Option<u64>,
    /// Search time reported by the engine, in milliseconds.
    pub time_ms: Option<u64>,
    /// Principal variation.
    pub pv: Vec<String>,
}

/// Parses an `info` line of the primary variation.
///
/// Returns `None` for anything else: other commands, `info string`, or `multipv` > 1.
pub fn parse_info(line: &str) -> Option<SearchInfo> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first().copied() != Some("info") || tokens.get(1).copied() == Some("string") {
        return None;
    }

    let mut info = SearchInfo::default();
    let mut i = 1;
    while i < tokens.len() {
        let next = tokens.get(i + 1).copied();
        match tokens[i] {
            "multipv" => {
                if next.and_then(|v| v.parse::<u32>().ok()).unwrap_or(1) != 1 {
                    return None;
                }
                i += 1;
            }
            "depth" => {
                info.depth = next.and_then(|v| v.parse().ok());
                i += 1;
            }
            "seldepth" => {
                info.seldepth = next.and_then(|v| v.parse().ok());
                i += 1;
            }
            "nodes" => {
                info.nodes = next.and_then(|v| v.parse().ok());
                i += 1;
            }
            "time" => {
                info.time_ms = next.and_then(|v| v.parse().ok());
                i += 1;
            }
            "score" => {
                let value = tokens.get(i + 2).and_then(|v| v.parse::<i32>().ok());
                match (next, value) {
                    (Some("cp"), Some(v)) => {
                        info.score_kind = ScoreKind::Cp;
                        info.score = v;
                    }
                    (Some("mate"), Some(v)) => {
                        info.score_kind = ScoreKind::Mate;
                        info.score = v;
                    }
                    _ => {}
                }
                i += 2;
            }
            "pv" => {
                info.pv = tokens[i + 1..].iter().map(|s| s.to_string()).collect();
                break;
            }
            _ => {}
        }
        i += 1;
    }
    Some(info)
}

/// Extracts the option name from the body of an `option` line (`name <words> type ...`).
pub fn parse_option_name(rest: &str) -> Option<String> {
    let mut tokens = rest.split_whitespace().skip_while(|t| *t != "name").skip(1);
    let mut parts = Vec::new();
    for tok in tokens.by_ref() {
        if tok == "type" {
            break;
        }
        parts.push(tok);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Extracts `(bestmove, ponder)` from a `bestmove` line.
pub fn parse_bestmove(line: &str) -> Option<(String, Option<String>)> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("bestmove") {
        return None;
    }
    let mv = tokens.next()?.to_string();
    let ponder = match (tokens.next(), tokens.next()) {
        (Some("ponder"), Some(p)) => Some(p.to_string()),
        _ => None,
    };
    Some((mv, ponder))
}

#[cfg(test)]
mod info_tests {
    use super::*;

    #[test]
    fn mate_score_is_kept_raw() {
        let info = parse_info("info depth 20 seldepth 8 score mate -3 nodes 1234 time 15 pv e2e4").unwrap();
        assert_eq!(info.score_kind, ScoreKind::Mate);
        assert_eq!(info.score, -3);
        assert_eq!(info.depth, Some(20));
        assert_eq!(info.seldepth, Some(8));
        assert_eq!(info.nodes, Some(1234));
        assert_eq!(info.time_ms, Some(15));
        assert_eq!(info.pv, vec!["e2e4".to_string()]);
    }

    #[test]
    fn centipawn_score() {
        let info = parse_info("info depth 12 score cp 34 lowerbound nodes 99 pv d2d4 d7d5").unwrap();
        assert_eq!(info.score_kind, ScoreKind::Cp);
        assert_eq!(info.score, 34);
        assert_eq!(info.nodes, Some(99));
        assert_eq!(info.pv.len(), 2);
    }

    #[test]
    fn lines_without_score_have_err_kind() {
        let info = parse_info("info depth 3 currmove e2e4 currmovenumber 1").unwrap();
        assert_eq!(info.score_kind, ScoreKind::Err);
        assert_eq!(info.score, 0);
    }

    #[test]
    fn secondary_variations_and_strings_are_ignored() {
        assert!(parse_info("info multipv 2 depth 10 score cp 5 pv a2a3").is_none());
        assert!(parse_info("info string NNUE evaluation enabled").is_none());
        assert!(parse_info("bestmove e2e4").is_none());
        assert!(parse_info("info multipv 1 depth 10 score cp 5 pv a2a3").is_some());
    }

    #[test]
    fn option_names_may_contain_spaces() {
        assert_eq!(
            parse_option_name("name Skill Level type spin default 20 min 0 max 20"),
            Some("Skill Level".to_string())
        );
        assert_eq!(parse_option_name("type check"), None);
    }

    #[test]
    fn bestmove_with_ponder() {
        assert_eq!(
            parse_bestmove("bestmove e2e4 ponder e7e5"),
            Some(("e2e4".to_string(), Some("e7e5".to_string())))
        );
        assert_eq!(parse_bestmove("bestmove (none)"), Some(("(none)".to_string(), None)));
        assert_eq!(parse_bestmove("bestmove"), None);
    }
}
