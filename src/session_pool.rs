//! Keyed cache of running engine sessions.
//!
//! Spawning an engine and replaying its handshake is expensive, so a finished game hands its
//! sessions back to the pool and the next game of the same engine picks them up. Entries are
//! keyed by [`EngineIdentity`]; a [`Pooled`] guard gives exclusive access and returns the entry
//! when dropped. Entries that are no longer usable are discarded instead.

use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, trace};

use crate::{engine_config::EngineIdentity, session::EngineSession};

/// Something the pool can hand out more than once.
pub trait Reusable: Send {
    /// `false` once the entry must not be given to another caller.
    fn is_reusable(&mut self) -> bool;
}

impl Reusable for EngineSession {
    fn is_reusable(&mut self) -> bool {
        self.is_alive()
    }
}

#[derive(Debug)]
struct PoolState<T> {
    idle: Vec<(EngineIdentity, T)>,
    in_use: usize,
}

/// Pool of reusable entries with a soft bound on live entries.
///
/// `acquire` never waits: when every live entry is checked out it creates another one, so the
/// bound can be exceeded while all entries are in use. The surplus is dropped as it comes back,
/// bringing the pool under `capacity` again. A tournament holds at most two sessions per worker
/// and sizes the pool accordingly, so it never goes over.
#[derive(Debug)]
pub struct SessionPool<T: Reusable> {
    state: Arc<Mutex<PoolState<T>>>,
    capacity: usize,
}

/// The pool of engine sessions used by tournaments.
pub type EnginePool = SessionPool<EngineSession>;

impl<T: Reusable> Clone for SessionPool<T> {
    fn clone(&self) -> Self {
        SessionPool {
            state: self.state.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Reusable> SessionPool<T> {
    /// An empty pool aiming at no more than `capacity` live entries (idle plus in use).
    pub fn new(capacity: usize) -> Self {
        SessionPool {
            state: Arc::new(Mutex::new(PoolState {
                idle: vec![],
                in_use: 0,
            })),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes an idle entry for `key`, or builds a new one with `create`.
    ///
    /// `create` runs without holding the pool lock. When the pool is full, an idle entry of
    /// another key is evicted first.
    pub fn acquire<E, F>(&self, key: EngineIdentity, create: F) -> Result<Pooled<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let evicted = {
            let mut state = self.lock();
            if let Some(pos) = state.idle.iter().position(|(k, _)| *k == key) {
                let (_, item) = state.idle.swap_remove(pos);
                state.in_use += 1;
                trace!(%key, "reusing pooled entry");
                return Ok(self.guard(key, item));
            }
            let evicted = if state.idle.len() + state.in_use >= self.capacity && !state.idle.is_empty() {
                Some(state.idle.remove(0))
            } else {
                None
            };
            state.in_use += 1;
            evicted
        };
        if let Some((old_key, old)) = evicted {
            debug!(key = %old_key, "evicting idle entry");
            drop(old);
        }

        match create() {
            Ok(item) => Ok(self.guard(key, item)),
            Err(e) => {
                self.lock().in_use -= 1;
                Err(e)
            }
        }
    }

    fn guard(&self, key: EngineIdentity, item: T) -> Pooled<T> {
        Pooled {
            item: Some(item),
            key,
            pool: self.clone(),
        }
    }

    fn release(&self, key: EngineIdentity, mut item: T) {
        let reusable = item.is_reusable();
        {
            let mut state = self.lock();
            state.in_use -= 1;
            if reusable && state.idle.len() + state.in_use < self.capacity {
                state.idle.push((key, item));
                return;
            }
        }
        debug!(%key, reusable, "discarding entry");
        drop(item);
    }

    /// Number of idle entries.
    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    /// Number of entries currently checked out.
    pub fn in_use_count(&self) -> usize {
        self.lock().in_use
    }

    /// Drops every idle entry.
    pub fn clear(&self) {
        let idle = std::mem::take(&mut self.lock().idle);
        drop(idle);
    }
}

/// Exclusive handle on a pooled entry. Returns it to the pool on drop.
#[derive(Debug)]
pub struct Pooled<T: Reusable> {
    item: Option<T>,
    key: EngineIdentity,
    pool: SessionPool<T>,
}

impl<T: Reusable> Pooled<T> {
    /// Key the entry was acquired under.
    pub fn key(&self) -> EngineIdentity {
        self.key
    }
}

impl<T: Reusable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the item out.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reusable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reusable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(self.key, item);
        }
    }
}

#[cfg(test)]
mod session_pool_tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    #[derive(Debug)]
    struct Fake {
        id: usize,
        busy: Arc<AtomicBool>,
        alive: bool,
        drops: Arc<AtomicUsize>,
    }

    impl Reusable for Fake {
        fn is_reusable(&mut self) -> bool {
            self.alive
        }
    }

    impl Drop for Fake {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key(n: u64) -> EngineIdentity {
        EngineIdentity(n)
    }

    #[test]
    fn test_reuses_idle_entry_with_same_key() {
        let pool = SessionPool::new(4);
        let drops = Arc::new(AtomicUsize::new(0));
        let make = |id| {
            let drops = drops.clone();
            move || -> Result<Fake, ()> {
                Ok(Fake {
                    id,
                    busy: Arc::new(AtomicBool::new(false)),
                    alive: true,
                    drops,
                })
            }
        };
        let first = pool.acquire(key(1), make(1)).unwrap();
        assert_eq!(pool.in_use_count(), 1);
        drop(first);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.acquire(key(1), make(2)).unwrap();
        assert_eq!(again.id, 1);
        let other = pool.acquire(key(2), make(3)).unwrap();
        assert_eq!(other.id, 3);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dead_entry_is_discarded() {
        let pool = SessionPool::new(4);
        let drops = Arc::new(AtomicUsize::new(0));
        let d = drops.clone();
        let mut entry = pool
            .acquire(key(1), move || -> Result<Fake, ()> {
                Ok(Fake {
                    id: 1,
                    busy: Arc::new(AtomicBool::new(false)),
                    alive: true,
                    drops: d,
                })
            })
            .unwrap();
        entry.alive = false;
        drop(entry);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_full_pool_evicts_other_key() {
        let pool = SessionPool::new(1);
        let drops = Arc::new(AtomicUsize::new(0));
        let make = |id| {
            let drops = drops.clone();
            move || -> Result<Fake, ()> {
                Ok(Fake {
                    id,
                    busy: Arc::new(AtomicBool::new(false)),
                    alive: true,
                    drops,
                })
            }
        };
        drop(pool.acquire(key(1), make(1)).unwrap());
        let second = pool.acquire(key(2), make(2)).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_bound_is_soft_and_surplus_is_dropped_on_release() {
        let pool = SessionPool::new(1);
        let drops = Arc::new(AtomicUsize::new(0));
        let make = |id| {
            let drops = drops.clone();
            move || -> Result<Fake, ()> {
                Ok(Fake {
                    id,
                    busy: Arc::new(AtomicBool::new(false)),
                    alive: true,
                    drops,
                })
            }
        };
        let first = pool.acquire(key(1), make(1)).unwrap();
        let second = pool.acquire(key(2), make(2)).unwrap();
        assert_eq!(pool.in_use_count(), 2);

        drop(first);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(second);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_create_frees_slot() {
        let pool: SessionPool<Fake> = SessionPool::new(1);
        assert!(pool.acquire(key(1), || Err("no")).is_err());
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn test_no_two_holders_share_an_entry() {
        let pool = SessionPool::new(4);
        let drops = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                let drops = drops.clone();
                let violations = violations.clone();
                let created = created.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let drops = drops.clone();
                        let created = created.clone();
                        let entry = pool
                            .acquire(key((t % 2) as u64), move || -> Result<Fake, ()> {
                                Ok(Fake {
                                    id: created.fetch_add(1, Ordering::SeqCst),
                                    busy: Arc::new(AtomicBool::new(false)),
                                    alive: true,
                                    drops,
                                })
                            })
                            .unwrap();
                        if entry.busy.swap(true, Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        entry.busy.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(pool.in_use_count(), 0);
        pool.clear();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(
            drops.load(Ordering::SeqCst),
            created.load(Ordering::SeqCst)
        );
    }
}
