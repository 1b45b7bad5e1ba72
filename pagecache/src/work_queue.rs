//! WorkQueue module — a fixed pool of worker threads draining a FIFO job
//! channel.
//!
//! The cache dispatches short-lived background work here: page fetches for
//! prefetch, partial and full evictions, and checkpoint clone serialization.
//! Enqueue never blocks; shutdown drains whatever is already queued before
//! joining the workers.

use crossbeam::channel;
use log::{info, warn};
use parking_lot::Mutex;
use std::thread;

/// A unit of background work.
type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size worker pool with FIFO dispatch.
///
/// Workers exit once the sending side is closed and the channel is empty,
/// so every job enqueued before [`WorkQueue::shutdown`] still runs.
pub struct WorkQueue {
    name: &'static str,
    sender: Mutex<Option<channel::Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawns `num_workers` threads (at least one) draining a shared
    /// unbounded channel.
    pub fn new(name: &'static str, num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let (tx, rx) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        info!("Started work queue '{name}' with {num_workers} workers");
        WorkQueue {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues `job` without blocking.
    ///
    /// After shutdown the job runs on the calling thread instead, so work
    /// handed to the queue is never dropped.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                // The channel is unbounded; send only fails once every
                // worker is gone. The job comes back inside the error and
                // still runs, on this thread.
                if let Err(channel::SendError(job)) = tx.send(Box::new(job)) {
                    drop(sender);
                    warn!("work queue '{}' has no workers, running job inline", self.name);
                    job();
                }
            }
            None => {
                drop(sender);
                warn!("work queue '{}' is shut down, running job inline", self.name);
                job();
            }
        }
    }

    /// Closes the channel and joins the workers after they drain the
    /// remaining jobs. Idempotent.
    pub fn shutdown(&self) {
        let tx = self.sender.lock().take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("worker thread of '{}' panicked during shutdown", self.name);
            }
        }
        info!("Work queue '{}' shut down", self.name);
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a periodic background thread (cleaner, checkpointer): a join
/// handle plus the sending half of its shutdown channel.
pub(crate) struct WorkerHandle {
    handle: thread::JoinHandle<()>,
    shutdown: Option<channel::Sender<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(handle: thread::JoinHandle<()>, shutdown: channel::Sender<()>) -> Self {
        WorkerHandle {
            handle,
            shutdown: Some(shutdown),
        }
    }

    /// Signals the thread and waits for it to exit.
    pub(crate) fn shutdown_and_join(mut self) {
        if let Some(tx) = self.shutdown.take() {
            // A send error means the thread is already gone.
            let _ = tx.send(());
        }
        if self.handle.join().is_err() {
            warn!("background thread panicked during shutdown");
        }
    }
}
