//! Cache module — the façade gluing the pair table, evictor, cleaner, and
//! checkpointer into the client-facing pin/unpin API.
//!
//! Threads that use [`Cache`] should not have to worry about other
//! threads: a pin is an exclusive reservation over one page, and every
//! cross-page guarantee the cache offers (checkpoint consistency, eviction
//! never touching pinned pages, close draining a file's background work)
//! is enforced here. The cache owns three worker pools (client-initiated
//! jobs, cache-initiated jobs, and checkpoint jobs) and one thread each
//! for eviction, cleaning, and checkpointing.

use crate::background_jobs::JobManager;
use crate::checkpointer::{CheckpointLogger, Checkpointer};
use crate::cleaner::Cleaner;
use crate::evictor::Evictor;
use crate::files_manager::{CacheFile, FileCallbacks, FilesManager, FilesManagerError};
use crate::pair::{
    BlockNum, CacheCallbacks, Dirty, FetchHooks, Pair, PairAttr, PairToken, PutFn, RemoveKeyFn,
};
use crate::pair_list::{full_hash, PairList};
use crate::work_queue::{WorkQueue, WorkerHandle};
use log::{error, info};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Error for [`Cache`] related operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Benign: the page is absent or unavailable right now.
    #[error("page not found or not available")]
    NotFound,
    /// Benign: `put` refuses to replace an existing page.
    #[error("page already present")]
    AlreadyPresent,
    /// Benign: the unlockers ran; restart the operation from scratch.
    #[error("operation would block, retry after restarting")]
    TryAgain,
    /// The file is closing or closed; no new pins are admitted.
    #[error("file is closing")]
    FileClosing,
    #[error("io error occurred: {0}")]
    Io(#[from] io::Error),
    #[error("files manager error: {0}")]
    FilesManager(#[from] FilesManagerError),
}

/// Construction-time tunables. Every period is hot-swappable afterwards;
/// a zero period disables the thread's automatic runs but leaves manual
/// triggering available.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// The memory limit `L` all eviction thresholds derive from.
    pub size_limit: i64,
    pub eviction_period: Duration,
    pub checkpoint_period: Duration,
    pub cleaner_period: Duration,
    /// Cleaner iterations per cycle.
    pub cleaner_iterations: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            size_limit: 128 * 1024 * 1024,
            eviction_period: Duration::from_secs(1),
            checkpoint_period: Duration::from_secs(60),
            cleaner_period: Duration::from_secs(1),
            cleaner_iterations: 5,
        }
    }
}

/// Process-wide counter snapshot; see [`Cache::stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub prefetches: u64,
    pub evictions: u64,
    pub partial_evictions: u64,
    pub cleaner_executions: u64,
    pub checkpoints: u64,
    pub size_current: i64,
    pub size_limit: i64,
    pub num_pairs: u32,
}

/// Callback run when a non-blocking pin cannot complete immediately. The
/// caller supplies these to release its own higher-level locks before the
/// cache blocks on disk.
pub type Unlocker<'a> = Box<dyn FnOnce() + 'a>;

fn run_unlockers(unlockers: Vec<Unlocker<'_>>) {
    for unlocker in unlockers {
        unlocker();
    }
}

/// Shared read access to a pinned page's value.
pub struct ValueRef<'a, V>(MappedMutexGuard<'a, V>);

impl<V> Deref for ValueRef<'_, V> {
    type Target = V;
    fn deref(&self) -> &V {
        &self.0
    }
}

/// Mutable access to a pinned page's value; only handed out by pins that
/// declared `may_modify`.
pub struct ValueRefMut<'a, V>(MappedMutexGuard<'a, V>);

impl<V> Deref for ValueRefMut<'_, V> {
    type Target = V;
    fn deref(&self) -> &V {
        &self.0
    }
}

impl<V> DerefMut for ValueRefMut<'_, V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.0
    }
}

/// A pin: an exclusive reservation over one resident page, held from pin
/// to unpin.
///
/// Dropping the guard unpins clean with unchanged attributes; use
/// [`PinnedPage::unpin`] to record dirtiness and new sizes, or
/// [`PinnedPage::unpin_and_remove`] to take the page out of the cache
/// entirely.
pub struct PinnedPage<V, D> {
    pair: Arc<Pair<V, D>>,
    ev: Arc<Evictor<V, D>>,
    list: Arc<PairList<V, D>>,
    may_modify: bool,
    released: bool,
}

impl<V, D> std::fmt::Debug for PinnedPage<V, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("may_modify", &self.may_modify)
            .field("released", &self.released)
            .finish()
    }
}

impl<V, D> PinnedPage<V, D> {
    pub(crate) fn adopt(
        pair: Arc<Pair<V, D>>,
        ev: Arc<Evictor<V, D>>,
        list: Arc<PairList<V, D>>,
        may_modify: bool,
    ) -> Self {
        PinnedPage {
            pair,
            ev,
            list,
            may_modify,
            released: false,
        }
    }

    pub fn key(&self) -> BlockNum {
        self.pair.key()
    }

    pub fn filenum(&self) -> crate::files_manager::FileNum {
        self.pair.filenum()
    }

    pub fn fullhash(&self) -> u32 {
        self.pair.fullhash
    }

    /// The page's current attributes. Read-only from the caller's point
    /// of view; they change only at unpin.
    pub fn attr(&self) -> PairAttr {
        self.pair.state.lock().attr
    }

    pub fn value(&self) -> ValueRef<'_, V> {
        ValueRef(MutexGuard::map(self.pair.value.lock(), |cell| {
            cell.as_mut().expect("pinned pair has no value")
        }))
    }

    pub fn value_mut(&mut self) -> ValueRefMut<'_, V> {
        assert!(
            self.may_modify,
            "value_mut on a pin without may_modify breaks the pin contract"
        );
        ValueRefMut(MutexGuard::map(self.pair.value.lock(), |cell| {
            cell.as_mut().expect("pinned pair has no value")
        }))
    }

    /// Two pins over the same resident entry compare equal; used by
    /// clients that cache pair references.
    pub fn same_pair(&self, other: &PinnedPage<V, D>) -> bool {
        Arc::ptr_eq(&self.pair, &other.pair)
    }

    /// Releases the pin, recording the dirty flag and (if
    /// `attr.is_valid`) the new attributes. Growth past the pressure
    /// threshold prods the eviction thread.
    pub fn unpin(mut self, dirty: Dirty, attr: PairAttr) {
        self.release(dirty, attr);
    }

    fn release(&mut self, dirty: Dirty, attr: PairAttr) {
        if self.released {
            return;
        }
        self.released = true;
        let old_attr;
        {
            let mut st = self.pair.state.lock();
            if dirty.is_dirty() {
                st.dirty = Dirty::Dirty;
            }
            old_attr = st.attr;
            if attr.is_valid {
                st.attr = attr;
            }
            self.pair.unlock_value_with(&mut st);
        }
        if attr.is_valid {
            self.ev.change_pair_attr(old_attr, attr);
            if attr.size > old_attr.size && self.ev.should_client_wake_eviction_thread() {
                self.ev.signal_eviction_thread();
            }
        }
    }

    /// Takes the page out of the cache: clears its checkpoint obligation,
    /// removes it from every structure, and frees the value. Any thread
    /// blocked on the page's lock wakes up, finds it gone, and retries as
    /// a miss.
    pub fn unpin_and_remove(mut self, remove_key: Option<&RemoveKeyFn>) {
        self.released = true;
        let pair = self.pair.clone();

        // Nothing may write this page anymore.
        pair.state.lock().dirty = Dirty::Clean;
        // Waits out a clone serialization still in flight.
        pair.lock_disk();

        {
            let mut inner = self.list.inner.write();
            let for_checkpoint = {
                let _cheap = self.list.pending_cheap.read();
                let mut st = pair.state.lock();
                std::mem::replace(&mut st.checkpoint_pending, false)
            };
            // Zero the pressure score so a racing cleaner scan cannot
            // select the pair while it is on its way out.
            let old_attr = {
                let mut st = pair.state.lock();
                let old = st.attr;
                st.attr.cache_pressure_size = 0;
                old
            };
            let mut new_attr = old_attr;
            new_attr.cache_pressure_size = 0;
            self.ev.change_pair_attr(old_attr, new_attr);

            if let Some(cb) = remove_key {
                cb(pair.key(), for_checkpoint);
            }
            self.list.remove(&mut inner, &pair);
            let mut st = pair.state.lock();
            pair.unlock_value_with(&mut st);
            pair.unlock_disk_with(&mut st);
        }
        self.ev.free_pair(&pair);
    }
}

impl<V, D> Drop for PinnedPage<V, D> {
    fn drop(&mut self) {
        self.release(Dirty::Clean, PairAttr::invalid());
    }
}

/// An already-pinned page a multi-page operation depends on, with the
/// dirtiness the caller has accumulated under that pin.
pub struct DependentPin<'a, V, D> {
    pub pin: &'a PinnedPage<V, D>,
    pub dirty: Dirty,
}

struct ThreadHandles {
    evictor: Option<JoinHandle<()>>,
    checkpointer: Option<WorkerHandle>,
    cleaner: Option<WorkerHandle>,
}

/// The cache manager. One instance mediates all page access for a set of
/// open files; see the crate docs for the big picture.
pub struct Cache<V, D = ()>
where
    V: Send + 'static,
    D: Send + 'static,
{
    list: Arc<PairList<V, D>>,
    files: Arc<FilesManager>,
    ev: Arc<Evictor<V, D>>,
    cp: Arc<Checkpointer<V, D>>,
    cleaner: Arc<Cleaner<V, D>>,
    client_wq: Arc<WorkQueue>,
    cache_wq: Arc<WorkQueue>,
    checkpoint_wq: Arc<WorkQueue>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    prefetches: AtomicU64,
    threads: Mutex<ThreadHandles>,
    shut_down: AtomicBool,
}

impl<V, D> Cache<V, D>
where
    V: Send + 'static,
    D: Send + 'static,
{
    /// Builds the cache and spawns its three background threads. Worker
    /// pool sizes scale with the CPU count.
    pub fn new(options: CacheOptions, logger: Option<Arc<dyn CheckpointLogger>>) -> Arc<Self> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let client_wq = Arc::new(WorkQueue::new("pagecache-client", workers));
        let cache_wq = Arc::new(WorkQueue::new("pagecache-cache", workers));
        let checkpoint_wq = Arc::new(WorkQueue::new("pagecache-checkpoint", workers));

        let list = Arc::new(PairList::new());
        let files = Arc::new(FilesManager::new());
        let ev = Evictor::new(
            list.clone(),
            cache_wq.clone(),
            options.size_limit,
            options.eviction_period,
        );
        let cp = Checkpointer::new(
            list.clone(),
            files.clone(),
            ev.clone(),
            checkpoint_wq.clone(),
            logger,
            options.checkpoint_period,
        );
        let cleaner = Cleaner::new(
            list.clone(),
            ev.clone(),
            cp.clone(),
            options.cleaner_period,
            options.cleaner_iterations,
        );

        let cache = Arc::new(Cache {
            list,
            files,
            ev: ev.clone(),
            cp: cp.clone(),
            cleaner: cleaner.clone(),
            client_wq,
            cache_wq,
            checkpoint_wq,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            prefetches: AtomicU64::new(0),
            threads: Mutex::new(ThreadHandles {
                evictor: None,
                checkpointer: None,
                cleaner: None,
            }),
            shut_down: AtomicBool::new(false),
        });
        {
            let mut threads = cache.threads.lock();
            threads.evictor = Some(Evictor::spawn(ev));
            threads.checkpointer = Some(Checkpointer::spawn(cp));
            threads.cleaner = Some(Cleaner::spawn(cleaner));
        }
        cache
    }

    /// The bucketing hash clients pass to every per-page operation.
    pub fn hash(filenum: crate::files_manager::FileNum, key: BlockNum) -> u32 {
        full_hash(filenum, key)
    }

    // -- files --------------------------------------------------------

    pub fn open_file(
        &self,
        path: impl AsRef<Path>,
        callbacks: FileCallbacks,
    ) -> Result<Arc<CacheFile>, CacheError> {
        Ok(self.files.open_file(path, callbacks)?)
    }

    /// Closes `cf`: refuses new pins, drains the file's background jobs,
    /// writes and frees its resident pages, runs the close callback, and
    /// forgets the descriptor.
    pub fn close_file(&self, cf: &Arc<CacheFile>) -> Result<(), CacheError> {
        info!("Closing filenum {}", cf.filenum());
        cf.closing.store(true, Ordering::Release);
        cf.jobs.drain();
        self.flush_file_inner(cf)?;
        if let Some(cb) = &cf.callbacks.close {
            cb(cf.fd(), cf.filenum())?;
        }
        self.files.remove(cf.filenum());
        Ok(())
    }

    /// Writes out every dirty resident page of `cf` on the worker pool,
    /// waits, then frees them all. A page still pinned by a client here is
    /// a caller bug; background disk work on a page (a checkpoint clone
    /// serialization in flight) is waited out.
    pub fn flush_file(&self, cf: &Arc<CacheFile>) -> Result<(), CacheError> {
        self.flush_file_inner(cf)
    }

    fn flush_file_inner(&self, cf: &Arc<CacheFile>) -> Result<(), CacheError> {
        let pairs: Vec<Arc<Pair<V, D>>> = {
            let inner = self.list.inner.read();
            inner
                .pairs()
                .filter(|p| p.filenum() == cf.filenum())
                .cloned()
                .collect()
        };

        let jobs = Arc::new(JobManager::new());
        let first_err: Arc<Mutex<Option<io::Error>>> = Arc::new(Mutex::new(None));
        for pair in &pairs {
            assert!(jobs.add_job());
            let pair = pair.clone();
            let ev = self.ev.clone();
            let list = self.list.clone();
            let jobs = jobs.clone();
            let first_err = first_err.clone();
            self.client_wq.enqueue(move || {
                pair.lock_value();
                let removed = pair.state.lock().removed;
                if !removed {
                    let pending = list.take_checkpoint_pending(&pair);
                    let dirty = pair.state.lock().dirty.is_dirty();
                    if dirty {
                        if let Err(e) = ev.write_locked_pair(&pair, pending) {
                            let mut slot = first_err.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                }
                pair.unlock_value();
                jobs.remove_job();
            });
        }
        jobs.wait_for_jobs();
        if let Some(e) = first_err.lock().take() {
            return Err(e.into());
        }

        // Take everything out. Acquiring each value phase waits out a
        // straggler that pinned in the instant before the file flipped to
        // closing; acquiring the disk phase waits out a checkpoint clone
        // serialization still writing this page from the checkpoint pool
        // (those jobs are tracked by the checkpointer, not by the file's
        // job counter, so the drain above did not cover them).
        for pair in &pairs {
            pair.lock_value();
            pair.lock_disk();
            let mut inner = self.list.inner.write();
            {
                let mut st = pair.state.lock();
                if st.removed {
                    pair.unlock_value_with(&mut st);
                    pair.unlock_disk_with(&mut st);
                    continue;
                }
            }
            self.list.remove(&mut inner, pair);
            drop(inner);
            self.ev.free_pair(pair);
            let mut st = pair.state.lock();
            pair.unlock_value_with(&mut st);
            pair.unlock_disk_with(&mut st);
        }
        Ok(())
    }

    // -- pinning ------------------------------------------------------

    /// Pins the page at `(cf, key)`, fetching it through `hooks` on a
    /// miss. With `may_modify`, any pending checkpoint obligation on the
    /// page is discharged before the pin is returned, so the caller can
    /// mutate freely.
    pub fn get_and_pin(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        may_modify: bool,
        callbacks: &CacheCallbacks<V, D>,
        hooks: &FetchHooks<V, D>,
    ) -> Result<PinnedPage<V, D>, CacheError> {
        self.pin_inner(cf, key, fullhash, may_modify, callbacks, hooks, None)
    }

    /// Like [`Cache::get_and_pin`], but atomically discharges the
    /// checkpoint obligations of the already-pinned `dependents` before
    /// returning. This is what lets a multi-page operation commit without
    /// any of its pages being serialized half-updated.
    pub fn get_and_pin_with_dependents(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        may_modify: bool,
        callbacks: &CacheCallbacks<V, D>,
        hooks: &FetchHooks<V, D>,
        dependents: &[DependentPin<'_, V, D>],
    ) -> Result<PinnedPage<V, D>, CacheError> {
        self.pin_inner(
            cf,
            key,
            fullhash,
            may_modify,
            callbacks,
            hooks,
            Some(dependents),
        )
    }

    fn pin_inner(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        may_modify: bool,
        callbacks: &CacheCallbacks<V, D>,
        hooks: &FetchHooks<V, D>,
        dependents: Option<&[DependentPin<'_, V, D>]>,
    ) -> Result<PinnedPage<V, D>, CacheError> {
        if cf.is_closing() {
            return Err(CacheError::FileClosing);
        }
        if self.ev.should_client_thread_sleep() {
            self.ev.wait_for_cache_pressure_to_subside();
        }
        if self.ev.should_client_wake_eviction_thread() {
            self.ev.signal_eviction_thread();
        }
        // Serializes this window against begin-checkpoint, so the
        // dependents' pending bits cannot be re-set midway.
        let _exp = dependents.map(|_| self.list.pending_expensive.read());

        loop {
            let existing = {
                let inner = self.list.inner.read();
                inner.find(cf.filenum(), key, fullhash)
            };
            if let Some(pair) = existing {
                pair.lock_value();
                {
                    let mut st = pair.state.lock();
                    if st.removed {
                        pair.unlock_value_with(&mut st);
                        continue;
                    }
                    Pair::<V, D>::touch_with(&mut st);
                }
                // A close that began while we were waiting wins: it is
                // about to assert the file quiescent.
                if cf.is_closing() {
                    pair.unlock_value();
                    return Err(CacheError::FileClosing);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                let serviced = (|| -> Result<(), CacheError> {
                    if may_modify {
                        let pending = self.list.take_checkpoint_pending(&pair);
                        if pending {
                            self.cp.write_locked_pair_for_checkpoint(&pair, true)?;
                        }
                    }
                    self.maybe_partial_fetch(&pair, hooks)?;
                    if let Some(deps) = dependents {
                        self.checkpoint_dependents(deps)?;
                    }
                    Ok(())
                })();
                if let Err(e) = serviced {
                    pair.unlock_value();
                    return Err(e);
                }
                return Ok(PinnedPage::adopt(
                    pair,
                    self.ev.clone(),
                    self.list.clone(),
                    may_modify,
                ));
            }

            // Miss: insert a pinned placeholder under the write lock, then
            // fetch without it.
            let inserted = {
                let mut inner = self.list.inner.write();
                // Re-checked under the write lock: a pair inserted after
                // close's flush snapshot would never be freed.
                if cf.is_closing() {
                    return Err(CacheError::FileClosing);
                }
                if inner.find(cf.filenum(), key, fullhash).is_some() {
                    // Another thread slipped the pair in; start over.
                    None
                } else {
                    let pair = Pair::new(
                        cf.clone(),
                        key,
                        fullhash,
                        callbacks.clone(),
                        Dirty::Clean,
                        PairAttr::invalid(),
                        None,
                        None,
                    );
                    self.list.insert(&mut inner, pair.clone());
                    let mut st = pair.state.lock();
                    let locked = pair.try_lock_value_with(&mut st);
                    assert!(locked, "freshly inserted pair must be idle");
                    drop(st);
                    Some(pair)
                }
            };
            let Some(pair) = inserted else {
                continue;
            };
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.fetch_pair(&pair, hooks)?;
            if let Some(deps) = dependents {
                if let Err(e) = self.checkpoint_dependents(deps) {
                    pair.unlock_value();
                    return Err(e);
                }
            }
            return Ok(PinnedPage::adopt(
                pair,
                self.ev.clone(),
                self.list.clone(),
                may_modify,
            ));
        }
    }

    /// Fills a pinned placeholder through the fetch callback, under the
    /// disk phase. On failure the placeholder is taken back out and the
    /// error surfaces to the pinning caller.
    fn fetch_pair(
        &self,
        pair: &Arc<Pair<V, D>>,
        hooks: &FetchHooks<V, D>,
    ) -> Result<(), CacheError> {
        pair.lock_disk();
        match (hooks.fetch)(
            pair.cachefile.fd(),
            pair.filenum(),
            pair.key(),
            pair.fullhash,
        ) {
            Ok(page) => {
                *pair.value.lock() = Some(page.value);
                pair.disk.lock().disk_data = page.disk_data;
                {
                    let mut st = pair.state.lock();
                    st.attr = page.attr;
                    st.dirty = page.dirty;
                }
                self.ev.add_pair_attr(page.attr);
                pair.unlock_disk();
                Ok(())
            }
            Err(e) => {
                pair.unlock_disk();
                let mut inner = self.list.inner.write();
                {
                    let mut st = pair.state.lock();
                    pair.unlock_value_with(&mut st);
                }
                self.list.remove(&mut inner, pair);
                Err(e.into())
            }
        }
    }

    /// Runs the partial fetch if the client's predicate asks for one.
    /// The value phase is held by the caller.
    fn maybe_partial_fetch(
        &self,
        pair: &Arc<Pair<V, D>>,
        hooks: &FetchHooks<V, D>,
    ) -> Result<(), CacheError> {
        let Some(required) = hooks.partial_fetch_required.as_ref() else {
            return Ok(());
        };
        let needed = {
            let cell = pair.value.lock();
            required(cell.as_ref().expect("pinned pair has no value"))
        };
        if !needed {
            return Ok(());
        }
        let pf = hooks
            .partial_fetch
            .as_ref()
            .expect("partial_fetch_required set without partial_fetch");
        pair.lock_disk();
        let result = {
            let mut vcell = pair.value.lock();
            let mut dcell = pair.disk.lock();
            pf(
                vcell.as_mut().expect("pinned pair has no value"),
                &mut dcell.disk_data,
                pair.cachefile.fd(),
            )
        };
        pair.unlock_disk();
        let attr = result?;
        if attr.is_valid {
            let old = {
                let mut st = pair.state.lock();
                let old = st.attr;
                st.attr = attr;
                old
            };
            self.ev.change_pair_attr(old, attr);
        }
        Ok(())
    }

    /// Snapshots and clears every dependent's pending bit in one pass
    /// under the cheap pending lock, then services the writes with no
    /// table lock held.
    fn checkpoint_dependents(
        &self,
        dependents: &[DependentPin<'_, V, D>],
    ) -> Result<(), CacheError> {
        let mut pending_flags = Vec::with_capacity(dependents.len());
        {
            let _cheap = self.list.pending_cheap.read();
            for dep in dependents {
                let pair = &dep.pin.pair;
                let mut st = pair.state.lock();
                if dep.dirty.is_dirty() {
                    st.dirty = Dirty::Dirty;
                }
                let was_pending = std::mem::replace(&mut st.checkpoint_pending, false);
                drop(st);
                if was_pending {
                    self.list.pending.remove(&(pair.filenum(), pair.key()));
                }
                pending_flags.push(was_pending);
            }
        }
        for (dep, was_pending) in dependents.iter().zip(pending_flags) {
            if was_pending {
                self.cp
                    .write_locked_pair_for_checkpoint(&dep.pin.pair, true)?;
            }
        }
        Ok(())
    }

    /// Non-waiting pin used by optimizers: succeeds only when the page is
    /// resident, idle, and not checkpoint pending (dirtying a page right
    /// before the checkpointer picks it up would force an extra write).
    pub fn maybe_get_and_pin(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
    ) -> Result<PinnedPage<V, D>, CacheError> {
        self.maybe_pin_inner(cf, key, fullhash, false)
    }

    /// Like [`Cache::maybe_get_and_pin`] but also refuses clean pages.
    /// Cheap way for a writer to reuse a page it already dirtied.
    pub fn maybe_get_and_pin_dirty(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
    ) -> Result<PinnedPage<V, D>, CacheError> {
        self.maybe_pin_inner(cf, key, fullhash, true)
    }

    fn maybe_pin_inner(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        require_dirty: bool,
    ) -> Result<PinnedPage<V, D>, CacheError> {
        if cf.is_closing() {
            return Err(CacheError::FileClosing);
        }
        let existing = {
            let inner = self.list.inner.read();
            inner.find(cf.filenum(), key, fullhash)
        };
        let Some(pair) = existing else {
            return Err(CacheError::NotFound);
        };
        {
            let mut st = pair.state.lock();
            if st.removed || !st.value_phase.idle() {
                return Err(CacheError::NotFound);
            }
            if require_dirty && !st.dirty.is_dirty() {
                return Err(CacheError::NotFound);
            }
            let locked = pair.try_lock_value_with(&mut st);
            assert!(locked, "idle pair must lock immediately");
        }
        if cf.is_closing() {
            pair.unlock_value();
            return Err(CacheError::FileClosing);
        }
        let pending = {
            let _cheap = self.list.pending_cheap.read();
            pair.state.lock().checkpoint_pending
        };
        if pending {
            pair.unlock_value();
            return Err(CacheError::NotFound);
        }
        {
            let mut st = pair.state.lock();
            Pair::<V, D>::touch_with(&mut st);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(PinnedPage::adopt(
            pair,
            self.ev.clone(),
            self.list.clone(),
            true,
        ))
    }

    /// Pin for callers holding higher-level locks that must not be held
    /// across a disk wait. Whenever the pin would block (a fetch, a
    /// partial fetch, a busy page, or an expensive checkpoint write), the
    /// unlockers run, the blocking work completes, and
    /// [`CacheError::TryAgain`] tells the caller to restart.
    pub fn get_and_pin_nonblocking(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        may_modify: bool,
        callbacks: &CacheCallbacks<V, D>,
        hooks: &FetchHooks<V, D>,
        unlockers: Vec<Unlocker<'_>>,
    ) -> Result<PinnedPage<V, D>, CacheError> {
        if cf.is_closing() {
            return Err(CacheError::FileClosing);
        }
        loop {
            let existing = {
                let inner = self.list.inner.read();
                inner.find(cf.filenum(), key, fullhash)
            };
            let Some(pair) = existing else {
                let inserted = {
                    let mut inner = self.list.inner.write();
                    if cf.is_closing() {
                        return Err(CacheError::FileClosing);
                    }
                    if inner.find(cf.filenum(), key, fullhash).is_some() {
                        None
                    } else {
                        let pair = Pair::new(
                            cf.clone(),
                            key,
                            fullhash,
                            callbacks.clone(),
                            Dirty::Clean,
                            PairAttr::invalid(),
                            None,
                            None,
                        );
                        self.list.insert(&mut inner, pair.clone());
                        let mut st = pair.state.lock();
                        let locked = pair.try_lock_value_with(&mut st);
                        assert!(locked, "freshly inserted pair must be idle");
                        drop(st);
                        Some(pair)
                    }
                };
                let Some(pair) = inserted else {
                    continue;
                };
                // The fetch is the blocking part; release the caller's
                // locks and do it now so the retry hits.
                run_unlockers(unlockers);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.fetch_pair(&pair, hooks)?;
                pair.unlock_value();
                if self.ev.should_client_thread_sleep() {
                    self.ev.wait_for_cache_pressure_to_subside();
                }
                if self.ev.should_client_wake_eviction_thread() {
                    self.ev.signal_eviction_thread();
                }
                return Err(CacheError::TryAgain);
            };

            let mut st = pair.state.lock();
            if st.removed {
                drop(st);
                continue;
            }
            if !st.value_phase.idle() {
                // Somebody expensive holds the page. Wait it out with the
                // caller's locks released.
                run_unlockers(unlockers);
                pair.lock_value_with(&mut st);
                drop(st);
                pair.unlock_value();
                return Err(CacheError::TryAgain);
            }
            let locked = pair.try_lock_value_with(&mut st);
            assert!(locked, "idle pair must lock immediately");
            Pair::<V, D>::touch_with(&mut st);
            drop(st);
            if cf.is_closing() {
                pair.unlock_value();
                return Err(CacheError::FileClosing);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);

            if may_modify {
                let pending = self.list.take_checkpoint_pending(&pair);
                if pending {
                    // A clone (or a clean page) resolves fast; a plain
                    // synchronous write does not, so the caller restarts.
                    let fast = !pair.state.lock().dirty.is_dirty()
                        || pair.callbacks.clone_value.is_some();
                    if fast {
                        if let Err(e) = self.cp.write_locked_pair_for_checkpoint(&pair, true) {
                            pair.unlock_value();
                            return Err(e.into());
                        }
                    } else {
                        run_unlockers(unlockers);
                        let result = self.cp.write_locked_pair_for_checkpoint(&pair, true);
                        pair.unlock_value();
                        result?;
                        return Err(CacheError::TryAgain);
                    }
                }
            }

            let needs_partial_fetch = match hooks.partial_fetch_required.as_ref() {
                Some(required) => {
                    let cell = pair.value.lock();
                    required(cell.as_ref().expect("pinned pair has no value"))
                }
                None => false,
            };
            if needs_partial_fetch {
                run_unlockers(unlockers);
                let result = self.maybe_partial_fetch(&pair, hooks);
                pair.unlock_value();
                result?;
                return Err(CacheError::TryAgain);
            }
            return Ok(PinnedPage::adopt(
                pair,
                self.ev.clone(),
                self.list.clone(),
                may_modify,
            ));
        }
    }

    /// Inserts a newly minted dirty page and returns it pinned. Fails
    /// with [`CacheError::AlreadyPresent`] (keeping the prior value) if
    /// the key is resident.
    pub fn put(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        value: V,
        attr: PairAttr,
        callbacks: &CacheCallbacks<V, D>,
        put_callback: Option<&PutFn<V, D>>,
    ) -> Result<PinnedPage<V, D>, CacheError> {
        assert!(attr.is_valid, "put requires valid attributes");
        if cf.is_closing() {
            return Err(CacheError::FileClosing);
        }
        if self.ev.should_client_thread_sleep() {
            self.ev.wait_for_cache_pressure_to_subside();
        }
        let pair = {
            let mut inner = self.list.inner.write();
            if cf.is_closing() {
                return Err(CacheError::FileClosing);
            }
            if inner.find(cf.filenum(), key, fullhash).is_some() {
                return Err(CacheError::AlreadyPresent);
            }
            let pair = Pair::new(
                cf.clone(),
                key,
                fullhash,
                callbacks.clone(),
                Dirty::Dirty,
                attr,
                Some(value),
                None,
            );
            self.list.insert(&mut inner, pair.clone());
            {
                let mut st = pair.state.lock();
                let locked = pair.try_lock_value_with(&mut st);
                assert!(locked, "freshly inserted pair must be idle");
            }
            // Still under the table write lock, so the caller records the
            // back-reference atomically with the insertion.
            if let Some(cb) = put_callback {
                cb(&PairToken { pair: pair.clone() });
            }
            pair
        };
        self.ev.add_pair_attr(attr);
        self.puts.fetch_add(1, Ordering::Relaxed);
        if self.ev.should_client_wake_eviction_thread() {
            self.ev.signal_eviction_thread();
        }
        Ok(PinnedPage::adopt(
            pair,
            self.ev.clone(),
            self.list.clone(),
            true,
        ))
    }

    /// Warms the cache in the background. Returns whether a background
    /// read was actually dispatched; an oversubscribed cache, a resident
    /// busy page, or a draining file all make this a no-op.
    pub fn prefetch(
        &self,
        cf: &Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        callbacks: &CacheCallbacks<V, D>,
        hooks: &FetchHooks<V, D>,
    ) -> Result<bool, CacheError> {
        if cf.is_closing() || self.ev.should_client_thread_sleep() {
            return Ok(false);
        }
        let mut existing = {
            let inner = self.list.inner.read();
            inner.find(cf.filenum(), key, fullhash)
        };
        if existing.is_none() {
            let mut inner = self.list.inner.write();
            match inner.find(cf.filenum(), key, fullhash) {
                Some(pair) => existing = Some(pair),
                None => {
                    if !cf.jobs.add_job() {
                        return Ok(false);
                    }
                    let pair = Pair::new(
                        cf.clone(),
                        key,
                        fullhash,
                        callbacks.clone(),
                        Dirty::Clean,
                        PairAttr::invalid(),
                        None,
                        None,
                    );
                    self.list.insert(&mut inner, pair.clone());
                    {
                        let mut st = pair.state.lock();
                        let locked = pair.try_lock_value_with(&mut st);
                        assert!(locked, "freshly inserted pair must be idle");
                    }
                    drop(inner);
                    self.prefetches.fetch_add(1, Ordering::Relaxed);
                    let ev = self.ev.clone();
                    let fetch = hooks.fetch.clone();
                    self.client_wq.enqueue(move || {
                        Self::background_fetch(&ev, &pair, &fetch);
                        pair.cachefile.jobs.remove_job();
                    });
                    return Ok(true);
                }
            }
        }

        let pair = existing.expect("resident pair");
        {
            let mut st = pair.state.lock();
            if st.removed || !Pair::<V, D>::is_idle(&st) {
                return Ok(false);
            }
            Pair::<V, D>::touch_with(&mut st);
            if hooks.partial_fetch_required.is_none() {
                return Ok(false);
            }
            let locked = pair.try_lock_value_with(&mut st);
            assert!(locked, "idle pair must lock immediately");
        }
        let required = hooks.partial_fetch_required.as_ref().unwrap();
        let needed = {
            let cell = pair.value.lock();
            required(cell.as_ref().expect("pinned pair has no value"))
        };
        if !needed || !cf.jobs.add_job() {
            pair.unlock_value();
            return Ok(false);
        }
        self.prefetches.fetch_add(1, Ordering::Relaxed);
        let ev = self.ev.clone();
        let pf = hooks
            .partial_fetch
            .as_ref()
            .expect("partial_fetch_required set without partial_fetch")
            .clone();
        self.client_wq.enqueue(move || {
            Self::background_partial_fetch(&ev, &pair, &pf);
            pair.cachefile.jobs.remove_job();
        });
        Ok(true)
    }

    /// Fetch running on a worker for prefetch. The worker owns the
    /// pair's value and disk phases and releases both.
    fn background_fetch(
        ev: &Arc<Evictor<V, D>>,
        pair: &Arc<Pair<V, D>>,
        fetch: &crate::pair::FetchFn<V, D>,
    ) {
        pair.lock_disk();
        match fetch(
            pair.cachefile.fd(),
            pair.filenum(),
            pair.key(),
            pair.fullhash,
        ) {
            Ok(page) => {
                *pair.value.lock() = Some(page.value);
                pair.disk.lock().disk_data = page.disk_data;
                {
                    let mut st = pair.state.lock();
                    st.attr = page.attr;
                    st.dirty = page.dirty;
                }
                ev.add_pair_attr(page.attr);
                pair.unlock_disk();
                pair.unlock_value();
            }
            Err(e) => {
                error!(
                    "fatal: prefetch read failed (filenum {}, key {}): {e}",
                    pair.filenum(),
                    pair.key()
                );
                std::process::abort();
            }
        }
    }

    fn background_partial_fetch(
        ev: &Arc<Evictor<V, D>>,
        pair: &Arc<Pair<V, D>>,
        pf: &crate::pair::PartialFetchFn<V, D>,
    ) {
        pair.lock_disk();
        let result = {
            let mut vcell = pair.value.lock();
            let mut dcell = pair.disk.lock();
            pf(
                vcell.as_mut().expect("prefetched pair has no value"),
                &mut dcell.disk_data,
                pair.cachefile.fd(),
            )
        };
        match result {
            Ok(attr) => {
                if attr.is_valid {
                    let old = {
                        let mut st = pair.state.lock();
                        let old = st.attr;
                        st.attr = attr;
                        old
                    };
                    ev.change_pair_attr(old, attr);
                }
                pair.unlock_disk();
                pair.unlock_value();
            }
            Err(e) => {
                error!(
                    "fatal: partial prefetch failed (filenum {}, key {}): {e}",
                    pair.filenum(),
                    pair.key()
                );
                std::process::abort();
            }
        }
    }

    // -- checkpoints, cleaning, tunables ------------------------------

    /// Runs a full checkpoint cycle on the calling thread.
    pub fn checkpoint(&self) -> Result<(), CacheError> {
        Ok(self.cp.checkpoint(None)?)
    }

    pub fn begin_checkpoint(&self) -> Result<(), CacheError> {
        Ok(self.cp.begin_checkpoint()?)
    }

    pub fn end_checkpoint(&self) -> Result<(), CacheError> {
        Ok(self.cp.end_checkpoint(None)?)
    }

    /// End-checkpoint with a hook running after data and headers are
    /// durable but before the end record is logged.
    pub fn end_checkpoint_with_hook(&self, hook: &dyn Fn()) -> Result<(), CacheError> {
        Ok(self.cp.end_checkpoint(Some(hook))?)
    }

    /// Runs one cleaner cycle on the calling thread; returns how many
    /// pages were handed to cleaner callbacks.
    pub fn run_cleaner(&self) -> usize {
        self.cleaner.run_cleaner()
    }

    /// Reserves a fraction of the reservable limit for a bulk loader's
    /// own allocations; blocks behind eviction under pressure. Returns
    /// the bytes actually reserved.
    pub fn reserve_memory(&self, fraction: f64) -> i64 {
        self.ev.reserve_memory(fraction)
    }

    pub fn release_reserved_memory(&self, reserved: i64) {
        self.ev.release_reserved_memory(reserved);
    }

    /// Runs `job` on the client pool, counted against `cf`'s background
    /// jobs so close waits for it. Returns false if the file is draining.
    pub fn enqueue_file_job<F>(&self, cf: &Arc<CacheFile>, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !cf.jobs.add_job() {
            return false;
        }
        let cf = cf.clone();
        self.client_wq.enqueue(move || {
            job();
            cf.jobs.remove_job();
        });
        true
    }

    pub fn set_size_limit(&self, bytes: i64) {
        self.ev.set_size_limit(bytes);
        self.ev.signal_eviction_thread();
    }

    pub fn set_eviction_period(&self, period: Duration) {
        self.ev.set_period(period);
    }

    pub fn set_checkpoint_period(&self, period: Duration) {
        self.cp.set_period(period);
    }

    pub fn set_cleaner_period(&self, period: Duration) {
        self.cleaner.set_period(period);
    }

    pub fn set_cleaner_iterations(&self, iterations: u32) {
        self.cleaner.set_iterations(iterations);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            evictions: self.ev.num_evictions(),
            partial_evictions: self.ev.num_partial_evictions(),
            cleaner_executions: self.cleaner.executions(),
            checkpoints: self.cp.num_checkpoints(),
            size_current: self.ev.size_current(),
            size_limit: self.ev.size_limit(),
            num_pairs: self.list.inner.read().n_pairs(),
        }
    }

    /// Quiesces the background threads, closes every file, and verifies
    /// the table emptied. Runs at most once; also invoked by `Drop`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down cache");
        {
            let mut threads = self.threads.lock();
            if let Some(handle) = threads.cleaner.take() {
                handle.shutdown_and_join();
            }
            if let Some(handle) = threads.checkpointer.take() {
                handle.shutdown_and_join();
            }
        }
        for cf in self.files.snapshot() {
            if let Err(e) = self.close_file(&cf) {
                error!(
                    "failed to close {} during shutdown: {e}",
                    cf.path().display()
                );
            }
        }
        self.ev.stop();
        {
            let mut threads = self.threads.lock();
            if let Some(handle) = threads.evictor.take() {
                let _ = handle.join();
            }
        }
        self.client_wq.shutdown();
        self.cache_wq.shutdown();
        self.checkpoint_wq.shutdown();
        assert_eq!(
            self.list.inner.read().n_pairs(),
            0,
            "resident pairs leaked through shutdown"
        );
    }
}

impl<V, D> Drop for Cache<V, D>
where
    V: Send + 'static,
    D: Send + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::{EvictionCost, FetchedPage, PartialEvictEstimate};
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    type TestCache = Cache<Vec<u8>, ()>;

    /// In-memory "disk": the flush callback writes into it, the fetch
    /// callback reads back out. The real fd stays untouched; the page
    /// format belongs to the client.
    #[derive(Default)]
    struct Backing {
        pages: PlMutex<HashMap<BlockNum, Vec<u8>>>,
        flushes: AtomicUsize,
        writes: AtomicUsize,
        fetches: AtomicUsize,
    }

    struct Fixture {
        _dir: TempDir,
        cache: Arc<TestCache>,
        cf: Arc<CacheFile>,
        backing: Arc<Backing>,
        callbacks: CacheCallbacks<Vec<u8>, ()>,
        hooks: FetchHooks<Vec<u8>, ()>,
    }

    fn make_callbacks(backing: &Arc<Backing>) -> CacheCallbacks<Vec<u8>, ()> {
        let b = backing.clone();
        CacheCallbacks::new(Arc::new(move |ctx| {
            b.flushes.fetch_add(1, Ordering::SeqCst);
            if ctx.do_write {
                b.writes.fetch_add(1, Ordering::SeqCst);
                b.pages.lock().insert(ctx.key, ctx.value.clone());
            }
            Ok(None)
        }))
    }

    fn make_hooks(backing: &Arc<Backing>) -> FetchHooks<Vec<u8>, ()> {
        let b = backing.clone();
        FetchHooks::new(Arc::new(move |_fd, _filenum, key, _fullhash| {
            b.fetches.fetch_add(1, Ordering::SeqCst);
            let value = b.pages.lock().get(&key).cloned().unwrap_or_default();
            let size = value.len().max(1) as i64;
            Ok(FetchedPage {
                value,
                disk_data: None,
                attr: PairAttr::new(size),
                dirty: Dirty::Clean,
            })
        }))
    }

    fn fixture_with_options(options: CacheOptions) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = TestCache::new(options, None);
        let cf = cache
            .open_file(dir.path().join("data.db"), FileCallbacks::default())
            .unwrap();
        let backing = Arc::new(Backing::default());
        let callbacks = make_callbacks(&backing);
        let hooks = make_hooks(&backing);
        Fixture {
            _dir: dir,
            cache,
            cf,
            backing,
            callbacks,
            hooks,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_options(CacheOptions {
            size_limit: 1 << 20,
            eviction_period: Duration::from_millis(100),
            checkpoint_period: Duration::from_secs(0),
            cleaner_period: Duration::from_secs(0),
            cleaner_iterations: 1,
        })
    }

    fn put_page(fx: &Fixture, key: BlockNum, bytes: &[u8]) {
        let fullhash = TestCache::hash(fx.cf.filenum(), key);
        let pin = fx
            .cache
            .put(
                &fx.cf,
                key,
                fullhash,
                bytes.to_vec(),
                PairAttr::new(bytes.len().max(1) as i64),
                &fx.callbacks,
                None,
            )
            .expect("put failed");
        pin.unpin(Dirty::Dirty, PairAttr::invalid());
    }

    fn pin_page(fx: &Fixture, key: BlockNum, may_modify: bool) -> PinnedPage<Vec<u8>, ()> {
        let fullhash = TestCache::hash(fx.cf.filenum(), key);
        fx.cache
            .get_and_pin(&fx.cf, key, fullhash, may_modify, &fx.callbacks, &fx.hooks)
            .expect("pin failed")
    }

    #[test]
    fn put_then_pin_returns_the_value() {
        let fx = fixture();
        put_page(&fx, 1, b"hello");
        let pin = pin_page(&fx, 1, false);
        assert_eq!(&*pin.value(), b"hello");
        drop(pin);
        let stats = fx.cache.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn duplicate_put_keeps_prior_value() {
        let fx = fixture();
        put_page(&fx, 1, b"first");
        let fullhash = TestCache::hash(fx.cf.filenum(), 1);
        let err = fx
            .cache
            .put(
                &fx.cf,
                1,
                fullhash,
                b"second".to_vec(),
                PairAttr::new(6),
                &fx.callbacks,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::AlreadyPresent));
        let pin = pin_page(&fx, 1, false);
        assert_eq!(&*pin.value(), b"first");
    }

    #[test]
    fn pin_miss_fetches_from_backing() {
        let fx = fixture();
        fx.backing.pages.lock().insert(7, b"on disk".to_vec());
        let pin = pin_page(&fx, 7, false);
        assert_eq!(&*pin.value(), b"on disk");
        drop(pin);
        assert_eq!(fx.backing.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(fx.cache.stats().misses, 1);

        // Second pin is a hit; no new fetch.
        let pin = pin_page(&fx, 7, false);
        drop(pin);
        assert_eq!(fx.backing.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unpin_dirty_then_flush_writes_back() {
        let fx = fixture();
        put_page(&fx, 3, b"dirty page");
        fx.cache.flush_file(&fx.cf).unwrap();
        assert_eq!(fx.backing.writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.backing.pages.lock().get(&3).unwrap().as_slice(),
            b"dirty page"
        );
        // The page is gone; the next pin fetches.
        let pin = pin_page(&fx, 3, false);
        assert_eq!(&*pin.value(), b"dirty page");
        drop(pin);
        assert_eq!(fx.backing.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_readers_on_one_page_serialize_but_all_succeed() {
        let fx = fixture();
        put_page(&fx, 9, b"shared");
        let readers = 8;
        let barrier = Arc::new(Barrier::new(readers));
        let mut handles = Vec::new();
        for _ in 0..readers {
            let cache = fx.cache.clone();
            let cf = fx.cf.clone();
            let callbacks = fx.callbacks.clone();
            let hooks = fx.hooks.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let fullhash = TestCache::hash(cf.filenum(), 9);
                let pin = cache
                    .get_and_pin(&cf, 9, fullhash, false, &callbacks, &hooks)
                    .expect("pin failed");
                assert_eq!(&*pin.value(), b"shared");
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fx.cache.stats().hits, 8);
    }

    #[test]
    fn maybe_pin_refuses_busy_and_pending_pages() {
        let fx = fixture();
        put_page(&fx, 4, b"page");
        let fullhash = TestCache::hash(fx.cf.filenum(), 4);

        // Busy: held by another pin.
        let held = pin_page(&fx, 4, false);
        assert!(matches!(
            fx.cache.maybe_get_and_pin(&fx.cf, 4, fullhash),
            Err(CacheError::NotFound)
        ));
        drop(held);

        // Idle: succeeds.
        let pin = fx.cache.maybe_get_and_pin(&fx.cf, 4, fullhash).unwrap();
        drop(pin);

        // Pending: refused so the checkpointer keeps the write.
        fx.cache.begin_checkpoint().unwrap();
        assert!(matches!(
            fx.cache.maybe_get_and_pin(&fx.cf, 4, fullhash),
            Err(CacheError::NotFound)
        ));
        fx.cache.end_checkpoint().unwrap();
        let pin = fx.cache.maybe_get_and_pin(&fx.cf, 4, fullhash).unwrap();
        drop(pin);
    }

    #[test]
    fn maybe_pin_dirty_refuses_clean_pages() {
        let fx = fixture();
        put_page(&fx, 5, b"page");
        let fullhash = TestCache::hash(fx.cf.filenum(), 5);
        // Still dirty from the put.
        let pin = fx.cache.maybe_get_and_pin_dirty(&fx.cf, 5, fullhash).unwrap();
        drop(pin);
        // Write it clean, then the dirty-only variant refuses.
        fx.cache.checkpoint().unwrap();
        assert!(matches!(
            fx.cache.maybe_get_and_pin_dirty(&fx.cf, 5, fullhash),
            Err(CacheError::NotFound)
        ));
        // The plain variant does not care.
        let pin = fx.cache.maybe_get_and_pin(&fx.cf, 5, fullhash).unwrap();
        drop(pin);
    }

    #[test]
    fn two_maybe_pins_return_the_same_pair() {
        let fx = fixture();
        put_page(&fx, 6, b"page");
        fx.cache.checkpoint().unwrap();
        let fullhash = TestCache::hash(fx.cf.filenum(), 6);
        let first = fx.cache.maybe_get_and_pin(&fx.cf, 6, fullhash).unwrap();
        let first_key = first.key();
        drop(first);
        let second = fx.cache.maybe_get_and_pin(&fx.cf, 6, fullhash).unwrap();
        assert_eq!(second.key(), first_key);
        // No fetch happened for either.
        assert_eq!(fx.backing.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nonblocking_pin_runs_unlockers_on_miss_then_succeeds() {
        let fx = fixture();
        fx.backing.pages.lock().insert(11, b"cold".to_vec());
        let fullhash = TestCache::hash(fx.cf.filenum(), 11);
        let unlocked = Arc::new(AtomicUsize::new(0));
        let u = unlocked.clone();
        let err = fx
            .cache
            .get_and_pin_nonblocking(
                &fx.cf,
                11,
                fullhash,
                false,
                &fx.callbacks,
                &fx.hooks,
                vec![Box::new(move || {
                    u.fetch_add(1, Ordering::SeqCst);
                })],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::TryAgain));
        assert_eq!(unlocked.load(Ordering::SeqCst), 1);

        // The fetch already happened; the retry pins without blocking and
        // without running unlockers.
        let pin = fx
            .cache
            .get_and_pin_nonblocking(&fx.cf, 11, fullhash, false, &fx.callbacks, &fx.hooks, vec![])
            .expect("retry should hit");
        assert_eq!(&*pin.value(), b"cold");
    }

    #[test]
    fn unpin_and_remove_forgets_the_page() {
        let fx = fixture();
        put_page(&fx, 12, b"doomed");
        let pin = pin_page(&fx, 12, true);
        let removed_keys: Arc<PlMutex<Vec<BlockNum>>> = Arc::new(PlMutex::new(Vec::new()));
        let rk = removed_keys.clone();
        let remove_key: RemoveKeyFn = Arc::new(move |key, _for_checkpoint| {
            rk.lock().push(key);
        });
        pin.unpin_and_remove(Some(&remove_key));
        assert_eq!(removed_keys.lock().as_slice(), &[12]);
        assert_eq!(fx.cache.stats().num_pairs, 0);
        assert_eq!(fx.cache.stats().size_current, 0);

        // Re-pinning fetches from the backing, which never saw a write.
        let pin = pin_page(&fx, 12, false);
        assert_eq!(&*pin.value(), b"");
        drop(pin);
        assert_eq!(fx.backing.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefetch_loads_in_background() {
        let fx = fixture();
        fx.backing.pages.lock().insert(20, b"warmed".to_vec());
        let dispatched = fx
            .cache
            .prefetch(&fx.cf, 20, TestCache::hash(fx.cf.filenum(), 20), &fx.callbacks, &fx.hooks)
            .unwrap();
        assert!(dispatched);
        // Close waits on the file's job counter, so after drain the fetch
        // has finished.
        fx.cf.jobs.wait_for_jobs();
        assert_eq!(fx.backing.fetches.load(Ordering::SeqCst), 1);
        let pin = pin_page(&fx, 20, false);
        assert_eq!(&*pin.value(), b"warmed");
        drop(pin);
        // The pin was a hit, not a second fetch.
        assert_eq!(fx.backing.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(fx.cache.stats().misses, 0);
        assert_eq!(fx.cache.stats().prefetches, 1);
    }

    #[test]
    fn prefetch_is_a_noop_for_resident_pages() {
        let fx = fixture();
        put_page(&fx, 21, b"resident");
        let dispatched = fx
            .cache
            .prefetch(&fx.cf, 21, TestCache::hash(fx.cf.filenum(), 21), &fx.callbacks, &fx.hooks)
            .unwrap();
        assert!(!dispatched);
    }

    #[test]
    fn put_callback_sees_the_pair_under_the_table_lock() {
        let fx = fixture();
        let token_key = Arc::new(AtomicUsize::new(usize::MAX));
        let tk = token_key.clone();
        let put_cb: PutFn<Vec<u8>, ()> = Arc::new(move |token| {
            tk.store(token.key() as usize, Ordering::SeqCst);
        });
        let fullhash = TestCache::hash(fx.cf.filenum(), 33);
        let pin = fx
            .cache
            .put(
                &fx.cf,
                33,
                fullhash,
                b"x".to_vec(),
                PairAttr::new(1),
                &fx.callbacks,
                Some(&put_cb),
            )
            .unwrap();
        assert_eq!(token_key.load(Ordering::SeqCst), 33);
        pin.unpin(Dirty::Dirty, PairAttr::invalid());
    }

    #[test]
    fn file_jobs_are_drained_by_close() {
        let fx = fixture();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        assert!(fx.cache.enqueue_file_job(&fx.cf, move || {
            thread::sleep(Duration::from_millis(20));
            r.fetch_add(1, Ordering::SeqCst);
        }));
        // Close must wait for the job before the file goes away.
        fx.cache.close_file(&fx.cf).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // A draining (now closed) file refuses new jobs.
        assert!(!fx.cache.enqueue_file_job(&fx.cf, || {}));
    }

    #[test]
    fn nonblocking_pin_waits_out_busy_pages_via_unlockers() {
        let fx = fixture();
        put_page(&fx, 70, b"busy");
        let fullhash = TestCache::hash(fx.cf.filenum(), 70);

        let holder = pin_page(&fx, 70, false);
        let unlocked = Arc::new(AtomicUsize::new(0));

        let cache = fx.cache.clone();
        let cf = fx.cf.clone();
        let callbacks = fx.callbacks.clone();
        let hooks = fx.hooks.clone();
        let u = unlocked.clone();
        let waiter = thread::spawn(move || {
            let err = cache
                .get_and_pin_nonblocking(
                    &cf,
                    70,
                    fullhash,
                    false,
                    &callbacks,
                    &hooks,
                    vec![Box::new(move || {
                        u.fetch_add(1, Ordering::SeqCst);
                    })],
                )
                .unwrap_err();
            assert!(matches!(err, CacheError::TryAgain));
        });

        // Give the waiter time to run its unlockers and park on the pair.
        while unlocked.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(holder);
        waiter.join().unwrap();

        // With the page idle again the nonblocking pin succeeds outright.
        let pin = fx
            .cache
            .get_and_pin_nonblocking(&fx.cf, 70, fullhash, false, &fx.callbacks, &fx.hooks, vec![])
            .unwrap();
        assert_eq!(&*pin.value(), b"busy");
    }

    #[test]
    fn close_file_fails_subsequent_pins() {
        let fx = fixture();
        put_page(&fx, 40, b"page");
        fx.cache.close_file(&fx.cf).unwrap();
        let fullhash = TestCache::hash(fx.cf.filenum(), 40);
        let err = fx
            .cache
            .get_and_pin(&fx.cf, 40, fullhash, false, &fx.callbacks, &fx.hooks)
            .unwrap_err();
        assert!(matches!(err, CacheError::FileClosing));
        // The dirty page went to the backing on the way out.
        assert_eq!(
            fx.backing.pages.lock().get(&40).unwrap().as_slice(),
            b"page"
        );
    }

    #[test]
    fn writer_pin_services_pending_checkpoint() {
        let fx = fixture();
        put_page(&fx, 50, b"v1");
        fx.cache.begin_checkpoint().unwrap();
        // The writer discharges the checkpoint write itself.
        let mut pin = pin_page(&fx, 50, true);
        assert_eq!(fx.backing.writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.backing.pages.lock().get(&50).unwrap().as_slice(),
            b"v1"
        );
        pin.value_mut().extend_from_slice(b"+mutation");
        pin.unpin(Dirty::Dirty, PairAttr::invalid());
        // Nothing left pending for the end phase.
        fx.cache.end_checkpoint().unwrap();
        assert_eq!(fx.backing.writes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.cache.stats().checkpoints, 1);
    }

    #[test]
    fn checkpoint_writes_all_dirty_pages() {
        let fx = fixture();
        for key in 0..5u64 {
            put_page(&fx, key, format!("page-{key}").as_bytes());
        }
        fx.cache.checkpoint().unwrap();
        assert_eq!(fx.backing.writes.load(Ordering::SeqCst), 5);
        for key in 0..5u64 {
            assert_eq!(
                fx.backing.pages.lock().get(&key).unwrap(),
                format!("page-{key}").as_bytes()
            );
        }
        // A second checkpoint has nothing to write.
        fx.cache.checkpoint().unwrap();
        assert_eq!(fx.backing.writes.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn clock_counter_saturates_under_repeated_hits() {
        let fx = fixture();
        put_page(&fx, 60, b"hot");
        for _ in 0..40 {
            let pin = pin_page(&fx, 60, false);
            drop(pin);
        }
        let fullhash = TestCache::hash(fx.cf.filenum(), 60);
        let pair = fx
            .cache
            .list
            .inner
            .read()
            .find(fx.cf.filenum(), 60, fullhash)
            .unwrap();
        assert_eq!(
            pair.state.lock().clock_count,
            crate::pair_list::CLOCK_SATURATION
        );
    }

    #[test]
    fn partial_eviction_shrinks_the_page_in_place() {
        let dir = TempDir::new().unwrap();
        let cache: Arc<TestCache> = Cache::new(
            CacheOptions {
                size_limit: 1 << 20,
                eviction_period: Duration::from_secs(3600),
                checkpoint_period: Duration::from_secs(0),
                cleaner_period: Duration::from_secs(0),
                cleaner_iterations: 1,
            },
            None,
        );
        let cf = cache
            .open_file(dir.path().join("pe.db"), FileCallbacks::default())
            .unwrap();
        let backing = Arc::new(Backing::default());
        let mut callbacks = make_callbacks(&backing);
        callbacks.partial_evict_estimate = Arc::new(|value: &Vec<u8>, _| PartialEvictEstimate {
            cost: EvictionCost::Cheap,
            bytes_freed: (value.len() / 2) as i64,
        });
        callbacks.partial_evict = Arc::new(|value: &mut Vec<u8>, old_attr| {
            value.truncate(value.len() / 2);
            let mut attr = old_attr;
            attr.size = value.len().max(1) as i64;
            attr
        });
        let hooks = make_hooks(&backing);
        let fullhash = TestCache::hash(cf.filenum(), 1);
        let pin = cache
            .put(
                &cf,
                1,
                fullhash,
                vec![0u8; 64],
                PairAttr::new(64),
                &callbacks,
                None,
            )
            .unwrap();
        pin.unpin(Dirty::Dirty, PairAttr::invalid());

        // Push size over the limit so the eviction pass runs; the clock
        // count starts at 3, so the first passes age and partially evict.
        cache.set_size_limit(32);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            cache.ev.signal_eviction_thread();
            if cache.stats().partial_evictions > 0 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "no partial eviction happened"
            );
            thread::sleep(Duration::from_millis(10));
        }
        let pin = cache
            .get_and_pin(&cf, 1, fullhash, false, &callbacks, &hooks)
            .unwrap();
        assert!(pin.value().len() < 64);
        drop(pin);
        drop(cf);
        cache.shutdown();
    }
}
