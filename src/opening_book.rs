//! Opening positions and their deterministic allocation to games.
//!
//! A book is prepared once per tournament: shuffled with a seed when the order is random,
//! rotated so that it starts at the first opening still to be played, and truncated to the
//! number of openings the remaining games need. After that, [`OpeningSource::next_index`] hands
//! out indices from an atomic counter, so workers can fetch openings concurrently.
//!
//! Whatever the number of restarts, the game with ordinal `n` always gets opening
//! `shuffled[(start - 1 + n / games_per_round) % len]`.

use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{bail, Context};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// FEN of the standard initial position.
pub const STARTPOS_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    /// White.
    White,
    /// Black.
    Black,
}

impl Color {
    /// The other side.
    pub fn opposite(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// A starting position: FEN plus forced moves played from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opening {
    /// Position the game starts from.
    pub fen: String,
    /// Moves played before the engines take over, in UCI notation.
    pub moves: Vec<String>,
    /// Side to move in `fen`.
    pub side_to_move: Color,
}

impl Opening {
    /// Opening from a FEN without forced moves.
    pub fn from_fen(fen: impl Into<String>) -> Self {
        let fen = fen.into();
        let side_to_move = side_to_move_of(&fen);
        Opening {
            fen,
            moves: vec![],
            side_to_move,
        }
    }

    /// The standard initial position.
    pub fn startpos() -> Self {
        Opening::from_fen(STARTPOS_FEN)
    }

    /// Side to move once the forced moves have been played.
    pub fn side_to_move_after_moves(&self) -> Color {
        if self.moves.len() % 2 == 0 {
            self.side_to_move
        } else {
            self.side_to_move.opposite()
        }
    }
}

fn side_to_move_of(fen: &str) -> Color {
    match fen.split_whitespace().nth(1) {
        Some("b") => Color::Black,
        _ => Color::White,
    }
}

/// Order in which book entries are played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderType {
    /// File order.
    #[default]
    Sequential,
    /// Shuffled once with the tournament seed.
    Random,
}

/// Stored book entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookData {
    /// One FEN per entry, read from an EPD file.
    Epd(Vec<String>),
    /// Full openings with move prefixes.
    Openings(Vec<Opening>),
}

impl BookData {
    fn len(&self) -> usize {
        match self {
            BookData::Epd(v) => v.len(),
            BookData::Openings(v) => v.len(),
        }
    }
}

/// Deterministic, thread-safe supply of openings.
pub trait OpeningSource: Send + Sync {
    /// Index of the next opening to play, or `None` when the source is empty.
    fn next_index(&self) -> Option<usize>;

    /// Opening at `index`.
    fn at(&self, index: usize) -> Opening;

    /// Number of entries.
    fn len(&self) -> usize;

    /// True if the source has no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetches the next opening, falling back to the initial position for an empty source.
    fn fetch(&self) -> Opening {
        self.next_index()
            .map(|idx| self.at(idx))
            .unwrap_or_else(Opening::startpos)
    }
}

/// Opening book backed by a list of positions.
#[derive(Debug)]
pub struct OpeningBook {
    data: BookData,
    next: AtomicUsize,
}

impl OpeningBook {
    /// A book without entries; every game starts from the initial position.
    pub fn empty() -> Self {
        Self::from_data(BookData::Epd(vec![]))
    }

    /// Wraps already loaded entries.
    pub fn from_data(data: BookData) -> Self {
        OpeningBook {
            data,
            next: AtomicUsize::new(0),
        }
    }

    /// Parses EPD text: one position per non-empty line.
    ///
    /// EPD operations after the four position fields are dropped; halfmove and fullmove
    /// counters are kept when present, otherwise `0 1` is appended.
    ///
    /// # Errors
    ///
    /// A non-empty line has fewer than four fields.
    pub fn from_epd_str(text: &str) -> anyhow::Result<Self> {
        let mut fens = vec![];
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            fens.push(epd_to_fen(line).with_context(|| format!("invalid EPD on line {}", number + 1))?);
        }
        Ok(Self::from_data(BookData::Epd(fens)))
    }

    /// Reads an EPD file.
    ///
    /// # Errors
    ///
    /// The file cannot be read or is not valid EPD.
    pub fn from_epd_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Error opening EPD file: {}", path.display()))?;
        let book = Self::from_epd_str(&text)?;
        if book.len() == 0 {
            bail!("No openings found in EPD file: {}", path.display());
        }
        Ok(book)
    }

    /// Shuffles the entries with a Fisher–Yates pass driven by `seed`.
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        fn fisher_yates<T>(v: &mut [T], rng: &mut ChaCha8Rng) {
            for i in 0..v.len().saturating_sub(1) {
                let j = rng.random_range(i..v.len());
                v.swap(i, j);
            }
        }
        match &mut self.data {
            BookData::Epd(v) => fisher_yates(v, &mut rng),
            BookData::Openings(v) => fisher_yates(v, &mut rng),
        }
    }

    /// Makes the entry at `offset` (modulo length) the first one.
    pub fn rotate(&mut self, offset: usize) {
        let len = self.data.len();
        if len == 0 {
            return;
        }
        match &mut self.data {
            BookData::Epd(v) => v.rotate_left(offset % len),
            BookData::Openings(v) => v.rotate_left(offset % len),
        }
    }

    /// Keeps only the first `n` entries.
    pub fn truncate(&mut self, n: usize) {
        match &mut self.data {
            BookData::Epd(v) => {
                v.truncate(n);
                v.shrink_to_fit();
            }
            BookData::Openings(v) => {
                v.truncate(n);
                v.shrink_to_fit();
            }
        }
    }

    /// Prepares the book for a tournament.
    ///
    /// * `start`: 1-based index of the first opening of the tournament.
    /// * `first_encounter`: index of the first encounter still to play (non-zero on resume).
    /// * `encounters_left`: how many encounters remain.
    pub fn prepare(
        &mut self,
        order: OrderType,
        seed: u64,
        start: usize,
        first_encounter: usize,
        encounters_left: usize,
    ) {
        if order == OrderType::Random {
            self.shuffle(seed);
        }
        self.rotate(start.saturating_sub(1) + first_encounter);
        if encounters_left > 0 {
            self.truncate(encounters_left);
        }
        self.next.store(0, Ordering::SeqCst);
    }

    /// The stored entries.
    pub fn data(&self) -> &BookData {
        &self.data
    }
}

impl OpeningSource for OpeningBook {
    fn next_index(&self) -> Option<usize> {
        let len = self.data.len();
        if len == 0 {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::SeqCst) % len)
    }

    fn at(&self, index: usize) -> Opening {
        match &self.data {
            BookData::Epd(v) => v
                .get(index)
                .map(|fen| Opening::from_fen(fen.clone()))
                .unwrap_or_else(Opening::startpos),
            BookData::Openings(v) => v.get(index).cloned().unwrap_or_else(Opening::startpos),
        }
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

fn epd_to_fen(line: &str) -> anyhow::Result<String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        bail!("expected at least 4 fields, got {}", fields.len());
    }
    let counters = match (fields.get(4), fields.get(5)) {
        (Some(half), Some(full))
            if half.parse::<u32>().is_ok() && full.trim_end_matches(';').parse::<u32>().is_ok() =>
        {
            format!("{half} {}", full.trim_end_matches(';'))
        }
        _ => "0 1".to_string(),
    };
    Ok(format!("{} {counters}", fields[..4].join(" ")))
}

#[cfg(test)]
mod opening_book_tests {
    use super::*;

    fn book(n: usize) -> OpeningBook {
        let text = (0..n)
            .map(|i| format!("8/8/8/8/8/8/8/K{i} w - - id \"{i}\";"))
            .collect::<Vec<_>>()
            .join("\n");
        OpeningBook::from_epd_str(&text).unwrap()
    }

    fn fens(book: &OpeningBook) -> Vec<String> {
        match book.data() {
            BookData::Epd(v) => v.clone(),
            BookData::Openings(v) => v.iter().map(|o| o.fen.clone()).collect(),
        }
    }

    #[test]
    fn test_epd_parsing() {
        let book = OpeningBook::from_epd_str(
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 bm e5;\n\n\
             8/8/8/8/8/8/8/K7 w - - 3 40\n",
        )
        .unwrap();
        assert_eq!(book.len(), 2);
        let first = book.at(0);
        assert_eq!(first.fen, "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1");
        assert_eq!(first.side_to_move, Color::Black);
        assert_eq!(book.at(1).fen, "8/8/8/8/8/8/8/K7 w - - 3 40");
        assert!(OpeningBook::from_epd_str("not a fen").is_err());
    }

    #[test]
    fn test_empty_book_gives_startpos() {
        let book = OpeningBook::empty();
        assert_eq!(book.next_index(), None);
        assert_eq!(book.fetch(), Opening::startpos());
    }

    #[test]
    fn test_indices_cycle_over_the_book() {
        let book = book(3);
        let seen: Vec<_> = (0..7).map(|_| book.next_index().unwrap()).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_shuffle_is_a_seeded_permutation() {
        let mut a = book(50);
        let mut b = book(50);
        a.shuffle(42);
        b.shuffle(42);
        assert_eq!(fens(&a), fens(&b));

        let mut sorted = fens(&a);
        sorted.sort();
        let mut original = fens(&book(50));
        original.sort();
        assert_eq!(sorted, original);
        assert_ne!(fens(&a), fens(&book(50)));
    }

    #[test]
    fn test_resume_reproduces_remaining_sequence() {
        let games_per_round = 2;
        let encounters = 9;
        let start = 3;

        let mut full = book(5);
        full.prepare(OrderType::Random, 7, start, 0, encounters);
        let full_seq: Vec<_> = (0..encounters).map(|_| full.fetch().fen).collect();

        // Resume at ordinal 9: encounter 4 is half played and is replayed from its opening.
        let initial_ordinal = 9;
        let first = initial_ordinal / games_per_round;
        let mut resumed = book(5);
        resumed.prepare(OrderType::Random, 7, start, first, encounters - first);
        let resumed_seq: Vec<_> = (first..encounters).map(|_| resumed.fetch().fen).collect();

        assert_eq!(resumed_seq, full_seq[first..]);
    }

    #[test]
    fn test_start_position_offsets_first_opening() {
        let mut b = book(4);
        b.prepare(OrderType::Sequential, 0, 2, 0, 10);
        assert_eq!(b.fetch().fen, "8/8/8/8/8/8/8/K1 w - - 0 1");
    }
}
