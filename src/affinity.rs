//! Allocation of CPU cores to running games.
//!
//! The allocator owns the set of free core indices. A job asks for as many cores as its two
//! engines need; the returned [`CoreLease`] gives them back when dropped.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{bail, Context};
use tracing::warn;

/// Where the set of usable cores comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AffinityMode {
    /// No pinning at all.
    #[default]
    Disabled,
    /// All physical cores of the machine.
    Physical,
    /// All logical cores, hyper-threads included.
    Logical,
    /// An explicit cpu list such as `"0-3,6"`.
    List(String),
}

/// Shared pool of free cores.
#[derive(Debug, Clone)]
pub struct AffinityAllocator {
    free: Arc<Mutex<BTreeSet<usize>>>,
    enabled: bool,
    warned: Arc<AtomicBool>,
}

impl AffinityAllocator {
    /// Builds the free set for `mode`.
    ///
    /// # Errors
    ///
    /// The cpu list cannot be parsed.
    pub fn new(mode: &AffinityMode) -> anyhow::Result<Self> {
        let (cores, enabled) = match mode {
            AffinityMode::Disabled => (BTreeSet::new(), false),
            AffinityMode::Physical => ((0..num_cpus::get_physical()).collect(), true),
            AffinityMode::Logical => {
                let mut sys = sysinfo::System::new();
                sys.refresh_cpu_all();
                let count = sys.cpus().len().max(1);
                ((0..count).collect(), true)
            }
            AffinityMode::List(list) => (
                parse_cpu_list(list).context("error parsing cpu list")?,
                true,
            ),
        };
        Ok(AffinityAllocator {
            free: Arc::new(Mutex::new(cores)),
            enabled,
            warned: Arc::new(AtomicBool::new(false)),
        })
    }

    /// An allocator that never pins.
    pub fn disabled() -> Self {
        AffinityAllocator {
            free: Arc::new(Mutex::new(BTreeSet::new())),
            enabled: false,
            warned: Arc::new(AtomicBool::new(true)),
        }
    }

    /// True unless built with [`AffinityMode::Disabled`].
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of cores currently free.
    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    /// Takes the `n` lowest free cores.
    ///
    /// Returns `None` if affinity is disabled or fewer than `n` cores are free; the first
    /// shortage is reported once, after which games silently run unpinned.
    pub fn allocate(&self, n: usize) -> Option<CoreLease> {
        if !self.enabled || n == 0 {
            return None;
        }
        let cores = {
            let mut free = self.free.lock().ok()?;
            if free.len() < n {
                None
            } else {
                let taken: Vec<usize> = free.iter().take(n).copied().collect();
                for core in &taken {
                    free.remove(core);
                }
                Some(taken)
            }
        };
        match cores {
            Some(cores) => Some(CoreLease {
                cores,
                allocator: self.clone(),
            }),
            None => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!("not enough free cores to pin {n} threads, running unpinned");
                }
                None
            }
        }
    }

    /// Returns `cores` to the free set.
    pub fn release(&self, cores: &[usize]) {
        if let Ok(mut free) = self.free.lock() {
            free.extend(cores.iter().copied());
        }
    }

    /// Reports a pinning failure once.
    pub(crate) fn warn_pin_failure(&self, error: &anyhow::Error) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("could not pin engine process, running unpinned: {error:#}");
        }
    }
}

/// Cores held by one game. Returned to the allocator on drop.
#[derive(Debug)]
pub struct CoreLease {
    cores: Vec<usize>,
    allocator: AffinityAllocator,
}

impl CoreLease {
    /// The leased core indices, ascending.
    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    /// Splits the lease between two engines: the first `first` cores and the rest.
    pub fn split(&self, first: usize) -> (&[usize], &[usize]) {
        self.cores.split_at(first.min(self.cores.len()))
    }
}

impl Drop for CoreLease {
    fn drop(&mut self) {
        self.allocator.release(&self.cores);
    }
}

/// Parses a cpu list: comma-separated indices or inclusive ranges, e.g. `"0-3,6"`.
pub fn parse_cpu_list(s: &str) -> anyhow::Result<BTreeSet<usize>> {
    if s.trim().is_empty() {
        bail!("Empty string");
    }
    let mut set = BTreeSet::new();
    for item in s.split(',').map(str::trim) {
        let bounds: Vec<&str> = item.split('-').collect();
        match bounds.as_slice() {
            [value] => {
                let value: usize = value
                    .parse()
                    .with_context(|| format!("could not parse {value}"))?;
                set.insert(value);
            }
            [start, end] => {
                let start: usize = start
                    .parse()
                    .with_context(|| format!("could not parse {start}"))?;
                let end: usize = end
                    .parse()
                    .with_context(|| format!("could not parse {end}"))?;
                set.extend(start.min(end)..=start.max(end));
            }
            _ => bail!(
                "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
            ),
        }
    }
    Ok(set)
}

#[cfg(test)]
mod affinity_tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        let set = parse_cpu_list("0-3,6").unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 6]);
        let set = parse_cpu_list("5-4, 1").unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![1, 4, 5]);
        assert!(parse_cpu_list("").is_err());
        assert!(parse_cpu_list("1-2-3").is_err());
        assert!(parse_cpu_list("a").is_err());
    }

    #[test]
    fn test_allocate_lowest_and_release_on_drop() {
        let alloc = AffinityAllocator::new(&AffinityMode::List("2,0,1,7".into())).unwrap();
        let lease = alloc.allocate(2).unwrap();
        assert_eq!(lease.cores(), &[0, 1]);
        assert_eq!(lease.split(1), (&[0][..], &[1][..]));
        let second = alloc.allocate(2).unwrap();
        assert_eq!(second.cores(), &[2, 7]);
        assert!(alloc.allocate(1).is_none());
        drop(lease);
        assert_eq!(alloc.available(), 2);
        assert_eq!(alloc.allocate(1).unwrap().cores(), &[0]);
    }

    #[test]
    fn test_disabled_never_allocates() {
        let alloc = AffinityAllocator::new(&AffinityMode::Disabled).unwrap();
        assert!(!alloc.is_enabled());
        assert!(alloc.allocate(1).is_none());
        assert!(AffinityAllocator::disabled().allocate(2).is_none());
    }
}
