//! Fixed-size thread pool running game jobs, and the cancel token shared with every game.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Stop flag shared by the scheduler, the workers and every session read loop.
///
/// Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Returns `true` only for the caller that actually set it.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Worker threads pulling jobs from a bounded queue.
///
/// [`submit`](Self::submit) blocks while the queue is full. Jobs still queued when the
/// [`CancelToken`] is set are dropped without running.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancelToken,
}

impl WorkerPool {
    /// Starts `threads` workers sharing a queue of `queue_size` pending jobs.
    ///
    /// # Errors
    ///
    /// A worker thread could not be spawned.
    pub fn new(threads: usize, queue_size: usize, cancel: CancelToken) -> anyhow::Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_size.max(1));
        let workers = (0..threads.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let cancel = cancel.clone();
                std::thread::Builder::new()
                    .name(format!("arena-worker-{id}"))
                    .spawn(move || worker_loop(id, &receiver, &cancel))
                    .context("could not spawn worker thread")
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(WorkerPool {
            sender: Some(sender),
            workers,
            cancel,
        })
    }

    /// Queues `job`, waiting for room if the queue is full.
    ///
    /// Returns `false` if the pool is cancelled or already joined; the job is then dropped.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }
        match &self.sender {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Closes the queue and waits for every worker to finish.
    pub fn join(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a worker thread panicked outside of a job");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop(id: usize, receiver: &Receiver<Job>, cancel: &CancelToken) {
    for job in receiver.iter() {
        if cancel.is_cancelled() {
            trace!(worker = id, "cancelled, dropping job");
            continue;
        }
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker = id, "job panicked");
        }
    }
}
