//! Checkpointer module — the two-phase protocol that turns the running
//! cache into a crash-consistent on-disk snapshot without stopping the
//! workload.
//!
//! Begin-checkpoint logs a `begin_checkpoint` record, then walks every
//! resident pair of every checkpointed file under all three pending locks
//! and sets its pending bit. End-checkpoint drains the pending set: each
//! still-pending dirty pair is either cloned (writers proceed immediately
//! while a worker serializes the snapshot) or written synchronously, after
//! which the per-file header callbacks run and the `end_checkpoint` record
//! is logged with the LSN chosen at begin. Every page that was dirty at
//! begin is durable by the time end-checkpoint returns.
//!
//! A pending pair does not have to wait for the checkpoint thread: the
//! next writer to pin it, the cleaner, or the evictor may service the
//! write first and clear the bit, which is what keeps checkpointing off
//! the client's critical path.

use crate::background_jobs::JobManager;
use crate::evictor::Evictor;
use crate::files_manager::{CacheFile, FilesManager, Lsn};
use crate::pair::{Dirty, Pair};
use crate::pair_list::PairList;
use crate::work_queue::{WorkQueue, WorkerHandle};
use crossbeam::channel;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// The transactional logger, as far as the checkpointer cares: two record
/// kinds, with the begin LSN threaded through to the end record so
/// recovery started at that LSN sees a consistent state.
pub trait CheckpointLogger: Send + Sync {
    /// Logs `begin_checkpoint` and returns the LSN it was assigned.
    fn begin_checkpoint(&self) -> io::Result<Lsn>;

    /// Logs `end_checkpoint` carrying the begin LSN, the number of files
    /// and live transactions covered, and whether to fsync the log.
    fn end_checkpoint(
        &self,
        begin_lsn: Lsn,
        num_files: u32,
        num_txns: u32,
        fsync: bool,
    ) -> io::Result<()>;
}

struct CheckpointSession {
    in_progress: bool,
    files: Vec<Arc<CacheFile>>,
    num_txns: u32,
}

/// Drives begin/end checkpoint; owns the clone-serialization accounting.
pub(crate) struct Checkpointer<V, D> {
    list: Arc<PairList<V, D>>,
    files: Arc<FilesManager>,
    ev: Arc<Evictor<V, D>>,
    wq: Arc<WorkQueue>,
    clone_jobs: Arc<JobManager>,
    logger: Option<Arc<dyn CheckpointLogger>>,
    lsn_in_progress: AtomicU64,
    session: Mutex<CheckpointSession>,
    period_ms: AtomicU64,
    num_checkpoints: AtomicU64,
}

impl<V: Send + 'static, D: Send + 'static> Checkpointer<V, D> {
    pub(crate) fn new(
        list: Arc<PairList<V, D>>,
        files: Arc<FilesManager>,
        ev: Arc<Evictor<V, D>>,
        wq: Arc<WorkQueue>,
        logger: Option<Arc<dyn CheckpointLogger>>,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Checkpointer {
            list,
            files,
            ev,
            wq,
            clone_jobs: Arc::new(JobManager::new()),
            logger,
            lsn_in_progress: AtomicU64::new(0),
            session: Mutex::new(CheckpointSession {
                in_progress: false,
                files: Vec::new(),
                num_txns: 0,
            }),
            period_ms: AtomicU64::new(period.as_millis() as u64),
            num_checkpoints: AtomicU64::new(0),
        })
    }

    pub(crate) fn set_period(&self, period: Duration) {
        self.period_ms
            .store(period.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn num_checkpoints(&self) -> u64 {
        self.num_checkpoints.load(Ordering::SeqCst)
    }

    pub(crate) fn lsn_in_progress(&self) -> Lsn {
        self.lsn_in_progress.load(Ordering::SeqCst)
    }

    /// Runs a full checkpoint cycle, skipping quietly if one is already in
    /// progress (a manual begin without its end yet).
    pub(crate) fn checkpoint(&self, test_hook: Option<&dyn Fn()>) -> io::Result<()> {
        if self.session.lock().in_progress {
            debug!("checkpoint already in progress, skipping");
            return Ok(());
        }
        self.begin_checkpoint()?;
        self.end_checkpoint(test_hook)
    }

    /// Phase one: pick the LSN and mark every resident pair of every
    /// checkpointed file pending.
    pub(crate) fn begin_checkpoint(&self) -> io::Result<()> {
        let mut session = self.session.lock();
        assert!(!session.in_progress, "overlapping begin_checkpoint");

        // 1. Snapshot the open files and pin them against close.
        let files: Vec<Arc<CacheFile>> = self
            .files
            .snapshot()
            .into_iter()
            .filter(|cf| !cf.is_closing())
            .collect();
        for cf in &files {
            if let Some(cb) = &cf.callbacks.note_pin_by_checkpoint {
                cb(cf.filenum());
            }
            cf.for_checkpoint.store(true, Ordering::Release);
        }

        // 2. The begin record fixes the checkpoint's LSN.
        let lsn = match &self.logger {
            Some(logger) => logger.begin_checkpoint()?,
            None => 0,
        };
        self.lsn_in_progress.store(lsn, Ordering::SeqCst);

        // 3. Each file logs the live transactions it still carries.
        let mut num_txns = 0u32;
        for cf in &files {
            if let Some(cb) = &cf.callbacks.log_open_file {
                num_txns += cb(cf.filenum(), lsn)?;
            }
        }

        self.clone_jobs.reset();

        // 4. Mark everything pending. The expensive lock serializes this
        // against dependent-pin windows, the cheap lock against pending
        // clears, and the table read lock against inserts and evictions.
        {
            let _exp = self.list.pending_expensive.write();
            let inner = self.list.inner.read();
            let _cheap = self.list.pending_cheap.write();
            for pair in inner.pairs() {
                if !pair.cachefile.is_for_checkpoint() {
                    continue;
                }
                let mut st = pair.state.lock();
                assert!(
                    !st.checkpoint_pending,
                    "pair still pending from a previous checkpoint"
                );
                st.checkpoint_pending = true;
                drop(st);
                self.list
                    .pending
                    .insert((pair.filenum(), pair.key()), pair.clone());
            }
        }

        // 5. Let each file capture its translation snapshot.
        for cf in &files {
            if let Some(cb) = &cf.callbacks.begin_checkpoint {
                cb(lsn)?;
            }
        }

        info!(
            "begin_checkpoint at lsn {lsn}: {} files, {} pending pages",
            files.len(),
            self.list.pending.len()
        );
        session.in_progress = true;
        session.files = files;
        session.num_txns = num_txns;
        Ok(())
    }

    /// Phase two: make every pending page durable, then write headers and
    /// the end record.
    pub(crate) fn end_checkpoint(&self, test_hook: Option<&dyn Fn()>) -> io::Result<()> {
        let mut session = self.session.lock();
        assert!(session.in_progress, "end_checkpoint without begin");

        // 1. Drain the pending set.
        loop {
            let key = match self.list.pending.iter().next() {
                Some(entry) => *entry.key(),
                None => break,
            };
            let Some((_, pair)) = self.list.pending.remove(&key) else {
                continue;
            };
            self.write_pair_for_checkpoint_thread(&pair);
        }

        // 2. Clone serializations ride the work queue; wait them out.
        self.clone_jobs.wait_for_jobs();

        let lsn = self.lsn_in_progress();

        // 3. Headers and translation tables, now that the data is down.
        for cf in &session.files {
            if let Some(cb) = &cf.callbacks.checkpoint {
                cb(cf.fd(), cf.filenum())?;
            }
        }
        if let Some(hook) = test_hook {
            hook();
        }
        if let Some(logger) = &self.logger {
            logger.end_checkpoint(lsn, session.files.len() as u32, session.num_txns, true)?;
        }
        for cf in &session.files {
            if let Some(cb) = &cf.callbacks.end_checkpoint {
                cb(cf.fd(), cf.filenum())?;
            }
        }
        for cf in &session.files {
            cf.for_checkpoint.store(false, Ordering::Release);
            if let Some(cb) = &cf.callbacks.note_unpin_by_checkpoint {
                cb(cf.filenum());
            }
        }

        info!("end_checkpoint at lsn {lsn} complete");
        session.in_progress = false;
        session.files.clear();
        session.num_txns = 0;
        self.num_checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Writes one drained pair on the checkpoint thread. Clones when the
    /// pair allows it so any waiting writer is released after the clone
    /// rather than after the write.
    fn write_pair_for_checkpoint_thread(&self, pair: &Arc<Pair<V, D>>) {
        pair.lock_value();
        let (dirty, pending, removed) = {
            let st = pair.state.lock();
            (st.dirty, st.checkpoint_pending, st.removed)
        };
        if removed || !pending || !dirty.is_dirty() {
            self.clear_pending_bit(pair);
            pair.unlock_value();
            return;
        }
        if pair.callbacks.clone_value.is_some() {
            pair.lock_disk();
            self.clone_pair(pair);
            self.clear_pending_bit(pair);
            // Writers may proceed as soon as the snapshot exists.
            pair.unlock_value();
            self.dispatch_clone_write(pair.clone());
        } else {
            if let Err(e) = self.ev.write_locked_pair(pair, true) {
                error!(
                    "fatal: checkpoint write failed (filenum {}, key {}): {e}",
                    pair.filenum(),
                    pair.key()
                );
                std::process::abort();
            }
            self.clear_pending_bit(pair);
            pair.unlock_value();
        }
    }

    /// Services a pending pair on behalf of a writer, the cleaner, or a
    /// dependent-pin window. The caller holds the pair's value phase and
    /// has already taken the pending bit; the pin is kept.
    pub(crate) fn write_locked_pair_for_checkpoint(
        &self,
        pair: &Arc<Pair<V, D>>,
        checkpoint_pending: bool,
    ) -> io::Result<()> {
        if !checkpoint_pending || !pair.state.lock().dirty.is_dirty() {
            return Ok(());
        }
        if pair.callbacks.clone_value.is_some() {
            pair.lock_disk();
            self.clone_pair(pair);
            self.dispatch_clone_write(pair.clone());
            Ok(())
        } else {
            // No clone callback; the writer eats the write itself.
            self.ev.write_locked_pair(pair, true)
        }
    }

    /// Captures an immutable snapshot of the pair's value. Both phases are
    /// held. The pair comes out clean with the clone's size accounted in
    /// `size_current` until the serialization finishes.
    fn clone_pair(&self, pair: &Arc<Pair<V, D>>) {
        let clone_cb = pair
            .callbacks
            .clone_value
            .as_ref()
            .expect("clone_pair on a pair without a clone callback");
        let old_attr = pair.state.lock().attr;
        let (snapshot, new_attr) = {
            let mut vcell = pair.value.lock();
            clone_cb(vcell.as_mut().expect("cloning a pair with no value"), true)
        };
        let cloned_size = {
            let mut dcell = pair.disk.lock();
            assert!(dcell.cloned_value.is_none(), "clone already in flight");
            dcell.cloned_value = Some(snapshot);
            drop(dcell);
            let mut st = pair.state.lock();
            st.dirty = Dirty::Clean;
            if new_attr.is_valid {
                st.attr = new_attr;
            }
            st.cloned_size = st.attr.size;
            st.cloned_size
        };
        if new_attr.is_valid {
            self.ev.change_pair_attr(old_attr, new_attr);
        }
        self.ev.add_size_current(cloned_size);
    }

    /// Hands the clone to the checkpoint pool. The job owns the pair's
    /// disk phase and releases it after the write.
    fn dispatch_clone_write(&self, pair: Arc<Pair<V, D>>) {
        let ev = self.ev.clone();
        if self.clone_jobs.add_job() {
            let jobs = self.clone_jobs.clone();
            self.wq.enqueue(move || {
                if let Err(e) = ev.write_pair_data(&pair, true, true) {
                    error!(
                        "fatal: clone serialization failed (filenum {}, key {}): {e}",
                        pair.filenum(),
                        pair.key()
                    );
                    std::process::abort();
                }
                pair.unlock_disk();
                jobs.remove_job();
            });
        } else {
            // Shutting down; nobody will wait on the job, write in place.
            if let Err(e) = ev.write_pair_data(&pair, true, true) {
                error!(
                    "fatal: clone serialization failed (filenum {}, key {}): {e}",
                    pair.filenum(),
                    pair.key()
                );
                std::process::abort();
            }
            pair.unlock_disk();
        }
    }

    fn clear_pending_bit(&self, pair: &Arc<Pair<V, D>>) {
        let _cheap = self.list.pending_cheap.read();
        pair.state.lock().checkpoint_pending = false;
    }

    /// Spawns the periodic checkpoint thread. A zero period leaves it
    /// parked; checkpoints can still be triggered manually.
    pub(crate) fn spawn(cp: Arc<Self>) -> WorkerHandle {
        let (tx, rx) = channel::unbounded::<()>();
        let handle = thread::Builder::new()
            .name("pagecache-checkpointer".into())
            .spawn(move || {
                info!("Starting checkpoint thread");
                loop {
                    let period = cp.period_ms.load(Ordering::SeqCst);
                    let tick = if period == 0 {
                        Duration::from_millis(500)
                    } else {
                        Duration::from_millis(period)
                    };
                    match rx.recv_timeout(tick) {
                        Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => {
                            info!("Shutting down checkpoint thread");
                            break;
                        }
                        Err(channel::RecvTimeoutError::Timeout) => {
                            if period == 0 {
                                continue;
                            }
                            if let Err(e) = cp.checkpoint(None) {
                                error!("fatal: periodic checkpoint failed: {e}");
                                std::process::abort();
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn checkpoint thread");
        WorkerHandle::new(handle, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Logger that records calls instead of writing anywhere.
    pub(crate) struct RecordingLogger {
        next_lsn: AtomicU64,
        pub(crate) records: PlMutex<Vec<String>>,
    }

    impl RecordingLogger {
        pub(crate) fn new() -> Self {
            RecordingLogger {
                next_lsn: AtomicU64::new(100),
                records: PlMutex::new(Vec::new()),
            }
        }
    }

    impl CheckpointLogger for RecordingLogger {
        fn begin_checkpoint(&self) -> io::Result<Lsn> {
            let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
            self.records.lock().push(format!("begin {lsn}"));
            Ok(lsn)
        }

        fn end_checkpoint(
            &self,
            begin_lsn: Lsn,
            num_files: u32,
            num_txns: u32,
            fsync: bool,
        ) -> io::Result<()> {
            self.records
                .lock()
                .push(format!("end {begin_lsn} files={num_files} txns={num_txns} fsync={fsync}"));
            Ok(())
        }
    }

    fn make_checkpointer(
        logger: Arc<RecordingLogger>,
    ) -> (Arc<Checkpointer<Vec<u8>, ()>>, Arc<FilesManager>) {
        let list = Arc::new(PairList::new());
        let wq = Arc::new(WorkQueue::new("test-cp-wq", 2));
        let ev = Evictor::new(list.clone(), wq.clone(), 1 << 20, Duration::from_secs(1));
        let files = Arc::new(FilesManager::new());
        let cp = Checkpointer::new(
            list,
            files.clone(),
            ev,
            wq,
            Some(logger),
            Duration::from_secs(0),
        );
        (cp, files)
    }

    #[test]
    fn empty_checkpoint_logs_begin_and_end_with_same_lsn() {
        let logger = Arc::new(RecordingLogger::new());
        let (cp, _files) = make_checkpointer(logger.clone());
        cp.checkpoint(None).unwrap();
        let records = logger.records.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], "begin 100");
        assert!(records[1].starts_with("end 100 "));
    }

    #[test]
    fn checkpoint_counts_open_files() {
        let logger = Arc::new(RecordingLogger::new());
        let (cp, files) = make_checkpointer(logger.clone());
        let dir = tempfile::tempdir().unwrap();
        files
            .open_file(dir.path().join("a.db"), Default::default())
            .unwrap();
        files
            .open_file(dir.path().join("b.db"), Default::default())
            .unwrap();
        cp.checkpoint(None).unwrap();
        let records = logger.records.lock();
        assert!(records[1].contains("files=2"), "got {:?}", records[1]);
    }

    #[test]
    fn overlapping_checkpoint_is_skipped() {
        let logger = Arc::new(RecordingLogger::new());
        let (cp, _files) = make_checkpointer(logger.clone());
        cp.begin_checkpoint().unwrap();
        // A periodic tick arriving mid-checkpoint must not begin another.
        cp.checkpoint(None).unwrap();
        assert_eq!(logger.records.lock().len(), 1);
        cp.end_checkpoint(None).unwrap();
        assert_eq!(logger.records.lock().len(), 2);
    }
}
