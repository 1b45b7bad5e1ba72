//! Pair module — one resident page entry and its callback vtable.
//!
//! A [`Pair`] owns the client's in-memory page value plus the bookkeeping
//! the cache needs around it: sizes in several categories, the dirty bit,
//! the checkpoint-pending bit, the clock counter, and two *phased locks*.
//!
//! A phased lock is an exclusive lock whose holder/waiter count can be read
//! without blocking. The evictor and the cleaner use that query to skip
//! busy pairs cheaply instead of queueing behind them. Acquisition goes
//! through the pair's short mutex: the count is bumped, the condvar waited,
//! and the short mutex released while blocked, so a thread inspecting the
//! pair is never stuck behind a disk read. The `value` phase serializes
//! access to the page value (a pin holds it from pin to unpin); the `disk`
//! phase serializes I/O on the auxiliary disk data and checkpoint clones.

use crate::cache::PinnedPage;
use crate::files_manager::{CacheFile, FileNum};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fs::File;
use std::io;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Logical block number of a page within its file.
pub type BlockNum = u64;

/// Whether a resident page differs from its on-disk image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dirty {
    Clean,
    Dirty,
}

impl Dirty {
    pub fn is_dirty(self) -> bool {
        matches!(self, Dirty::Dirty)
    }
}

/// Sizes of a resident page, split into the categories the evictor
/// accounts separately.
///
/// An attribute with `is_valid == false` means "leave the current
/// attributes alone"; callbacks return it when they changed nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PairAttr {
    /// Total bytes attributed to the page.
    pub size: i64,
    pub nonleaf_size: i64,
    pub leaf_size: i64,
    pub rollback_size: i64,
    /// Cleaner selection score; zero means "never pick me for cleaning".
    pub cache_pressure_size: i64,
    pub is_valid: bool,
}

impl PairAttr {
    /// A valid attribute with only the total size set.
    pub fn new(size: i64) -> Self {
        PairAttr {
            size,
            is_valid: true,
            ..Default::default()
        }
    }

    /// An attribute carrying no update: unpinning with it leaves the
    /// pair's sizes alone. Also the state of a placeholder pair that has
    /// not been fetched yet.
    pub fn invalid() -> Self {
        PairAttr::default()
    }
}

/// How expensive the client judges a partial eviction of a page to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionCost {
    /// Run it inline on the eviction thread.
    Cheap,
    /// Dispatch it to a worker.
    Expensive,
}

/// Result of the partial-eviction estimate callback.
#[derive(Clone, Copy, Debug)]
pub struct PartialEvictEstimate {
    pub cost: EvictionCost,
    /// Bytes the client expects a partial eviction to free.
    pub bytes_freed: i64,
}

/// Everything a fetch callback produces for a missing page.
pub struct FetchedPage<V, D> {
    pub value: V,
    pub disk_data: Option<D>,
    pub attr: PairAttr,
    pub dirty: Dirty,
}

/// Arguments of the flush callback.
///
/// `do_write == true` asks the client to serialize `value` to `fd`;
/// `keep == false` announces that the pair is being destroyed after the
/// call, so external resources tied to the value should be released.
/// `is_clone` is set when `value` is a checkpoint snapshot rather than the
/// live copy.
pub struct FlushContext<'a, V, D> {
    pub fd: &'a File,
    pub filenum: FileNum,
    pub key: BlockNum,
    pub value: &'a mut V,
    pub disk_data: &'a mut Option<D>,
    pub attr: PairAttr,
    pub do_write: bool,
    pub keep: bool,
    pub for_checkpoint: bool,
    pub is_clone: bool,
}

/// Reads a missing page from disk. Runs under the pair's disk lock; must
/// not touch cache state.
pub type FetchFn<V, D> =
    Arc<dyn Fn(&File, FileNum, BlockNum, u32) -> io::Result<FetchedPage<V, D>> + Send + Sync>;

/// Side-effect-free predicate: does this value need a partial fetch before
/// the client can use it?
pub type PartialFetchRequiredFn<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Grows the value in place from disk; returns the new attributes.
pub type PartialFetchFn<V, D> =
    Arc<dyn Fn(&mut V, &mut Option<D>, &File) -> io::Result<PairAttr> + Send + Sync>;

/// Serializes a page (or announces its destruction); see [`FlushContext`].
/// Returns the new attributes if the write reshaped the value.
pub type FlushFn<V, D> =
    Arc<dyn Fn(FlushContext<'_, V, D>) -> io::Result<Option<PairAttr>> + Send + Sync>;

/// Estimates cost and gain of a partial eviction.
pub type PartialEvictEstimateFn<V, D> =
    Arc<dyn Fn(&V, Option<&D>) -> PartialEvictEstimate + Send + Sync>;

/// Shrinks the value in place; receives the old attributes, returns the
/// new ones.
pub type PartialEvictFn<V> = Arc<dyn Fn(&mut V, PairAttr) -> PairAttr + Send + Sync>;

/// Produces an immutable snapshot of the value for checkpointing, plus the
/// live pair's new attributes. The `bool` is the for-checkpoint flag.
pub type CloneFn<V> = Arc<dyn Fn(&mut V, bool) -> (V, PairAttr) + Send + Sync>;

/// Invoked by the cleaner with an exclusively pinned page. Dropping (or
/// explicitly unpinning) the [`PinnedPage`] releases the pin, so the "must
/// unpin before returning" contract holds by construction.
pub type CleanerFn<V, D> = Arc<dyn Fn(PinnedPage<V, D>) -> io::Result<()> + Send + Sync>;

/// Invoked inside `put` while the table write lock is still held, with a
/// back-reference to the freshly inserted pair.
pub type PutFn<V, D> = Arc<dyn Fn(&PairToken<V, D>) + Send + Sync>;

/// Invoked by `unpin_and_remove` while the pair is coming out of the
/// table; the `bool` says whether the pair was checkpoint pending.
pub type RemoveKeyFn = Arc<dyn Fn(BlockNum, bool) + Send + Sync>;

/// The per-pair vtable, attached when the pair enters the cache.
pub struct CacheCallbacks<V, D> {
    pub flush: FlushFn<V, D>,
    pub partial_evict_estimate: PartialEvictEstimateFn<V, D>,
    pub partial_evict: PartialEvictFn<V>,
    /// Pages with a clone callback are snapshotted at checkpoint time so
    /// writers are never blocked behind checkpoint serialization.
    pub clone_value: Option<CloneFn<V>>,
    /// Pages without a cleaner callback are still aged and evicted, just
    /// never cleaned.
    pub cleaner: Option<CleanerFn<V, D>>,
}

impl<V, D> CacheCallbacks<V, D> {
    /// A vtable with the mandatory flush callback and no-op partial
    /// eviction (cheap, frees nothing).
    pub fn new(flush: FlushFn<V, D>) -> Self {
        CacheCallbacks {
            flush,
            partial_evict_estimate: Arc::new(|_, _| PartialEvictEstimate {
                cost: EvictionCost::Cheap,
                bytes_freed: 0,
            }),
            partial_evict: Arc::new(|_, attr| attr),
            clone_value: None,
            cleaner: None,
        }
    }
}

impl<V, D> Clone for CacheCallbacks<V, D> {
    fn clone(&self) -> Self {
        CacheCallbacks {
            flush: self.flush.clone(),
            partial_evict_estimate: self.partial_evict_estimate.clone(),
            partial_evict: self.partial_evict.clone(),
            clone_value: self.clone_value.clone(),
            cleaner: self.cleaner.clone(),
        }
    }
}

/// Per-call hooks of the pin family: full fetch on miss, plus the optional
/// partial-fetch pair.
pub struct FetchHooks<V, D> {
    pub fetch: FetchFn<V, D>,
    pub partial_fetch_required: Option<PartialFetchRequiredFn<V>>,
    pub partial_fetch: Option<PartialFetchFn<V, D>>,
}

impl<V, D> FetchHooks<V, D> {
    pub fn new(fetch: FetchFn<V, D>) -> Self {
        FetchHooks {
            fetch,
            partial_fetch_required: None,
            partial_fetch: None,
        }
    }
}

impl<V, D> Clone for FetchHooks<V, D> {
    fn clone(&self) -> Self {
        FetchHooks {
            fetch: self.fetch.clone(),
            partial_fetch_required: self.partial_fetch_required.clone(),
            partial_fetch: self.partial_fetch.clone(),
        }
    }
}

/// One phase of a pair's locking: exclusive held flag plus the count of
/// holders and waiters, readable without blocking.
#[derive(Default)]
pub(crate) struct LockPhase {
    pub held: bool,
    pub users: u32,
}

impl LockPhase {
    pub(crate) fn idle(&self) -> bool {
        self.users == 0
    }
}

/// State behind the pair's short mutex. Everything here is inspected and
/// flipped in short critical sections only; long work happens under the
/// phased locks.
pub(crate) struct PairState {
    pub dirty: Dirty,
    pub attr: PairAttr,
    pub checkpoint_pending: bool,
    /// Clock counter, 0..=15. Incremented on touch, decremented by the
    /// clock hand.
    pub clock_count: u8,
    /// Bytes accounted in `size_evicting` while this pair's eviction is
    /// queued.
    pub size_evicting_estimate: i64,
    /// Size of the checkpoint clone currently in flight, zero otherwise.
    pub cloned_size: i64,
    /// Set once the pair has left the table; waiters on the phased locks
    /// re-check it after waking and bail out.
    pub removed: bool,
    pub value_phase: LockPhase,
    pub disk_phase: LockPhase,
}

/// A resident page entry.
pub struct Pair<V, D> {
    pub(crate) cachefile: Arc<CacheFile>,
    pub(crate) key: BlockNum,
    pub(crate) fullhash: u32,
    pub(crate) callbacks: CacheCallbacks<V, D>,
    pub(crate) state: Mutex<PairState>,
    pub(crate) value_cond: Condvar,
    pub(crate) disk_cond: Condvar,
    /// The client's page value. Locked only by the holder of the value
    /// phase (and by the destruction path after the phase is retired), so
    /// acquisition never blocks on page I/O.
    pub(crate) value: Mutex<Option<V>>,
    /// Auxiliary disk data and the in-flight checkpoint clone, guarded by
    /// the disk phase the same way.
    pub(crate) disk: Mutex<DiskCell<V, D>>,
    /// Arena slot in the pair table, maintained under the table write lock.
    pub(crate) slot: AtomicU32,
}

pub(crate) struct DiskCell<V, D> {
    pub disk_data: Option<D>,
    pub cloned_value: Option<V>,
}

impl<V, D> Pair<V, D> {
    pub(crate) fn new(
        cachefile: Arc<CacheFile>,
        key: BlockNum,
        fullhash: u32,
        callbacks: CacheCallbacks<V, D>,
        dirty: Dirty,
        attr: PairAttr,
        value: Option<V>,
        disk_data: Option<D>,
    ) -> Arc<Self> {
        Arc::new(Pair {
            cachefile,
            key,
            fullhash,
            callbacks,
            state: Mutex::new(PairState {
                dirty,
                attr,
                checkpoint_pending: false,
                clock_count: 0,
                size_evicting_estimate: 0,
                cloned_size: 0,
                removed: false,
                value_phase: LockPhase::default(),
                disk_phase: LockPhase::default(),
            }),
            value_cond: Condvar::new(),
            disk_cond: Condvar::new(),
            value: Mutex::new(value),
            disk: Mutex::new(DiskCell {
                disk_data,
                cloned_value: None,
            }),
            slot: AtomicU32::new(u32::MAX),
        })
    }

    pub(crate) fn filenum(&self) -> FileNum {
        self.cachefile.filenum()
    }

    pub(crate) fn key(&self) -> BlockNum {
        self.key
    }

    // -- value phase --------------------------------------------------

    pub(crate) fn lock_value(&self) {
        let mut st = self.state.lock();
        self.lock_value_with(&mut st);
    }

    /// Acquires the value phase while the caller already holds the short
    /// mutex, releasing it for the duration of any wait.
    pub(crate) fn lock_value_with(&self, st: &mut MutexGuard<'_, PairState>) {
        st.value_phase.users += 1;
        while st.value_phase.held {
            self.value_cond.wait(st);
        }
        st.value_phase.held = true;
    }

    /// Acquires the value phase only if nobody holds or awaits it.
    pub(crate) fn try_lock_value_with(&self, st: &mut MutexGuard<'_, PairState>) -> bool {
        if st.value_phase.idle() {
            st.value_phase.users = 1;
            st.value_phase.held = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn unlock_value(&self) {
        let mut st = self.state.lock();
        self.unlock_value_with(&mut st);
    }

    pub(crate) fn unlock_value_with(&self, st: &mut MutexGuard<'_, PairState>) {
        assert!(st.value_phase.held, "value phase released while not held");
        st.value_phase.held = false;
        st.value_phase.users -= 1;
        if st.value_phase.users > 0 {
            self.value_cond.notify_one();
        }
    }

    // -- disk phase ---------------------------------------------------

    pub(crate) fn lock_disk(&self) {
        let mut st = self.state.lock();
        self.lock_disk_with(&mut st);
    }

    pub(crate) fn lock_disk_with(&self, st: &mut MutexGuard<'_, PairState>) {
        st.disk_phase.users += 1;
        while st.disk_phase.held {
            self.disk_cond.wait(st);
        }
        st.disk_phase.held = true;
    }

    pub(crate) fn unlock_disk(&self) {
        let mut st = self.state.lock();
        self.unlock_disk_with(&mut st);
    }

    pub(crate) fn unlock_disk_with(&self, st: &mut MutexGuard<'_, PairState>) {
        assert!(st.disk_phase.held, "disk phase released while not held");
        st.disk_phase.held = false;
        st.disk_phase.users -= 1;
        if st.disk_phase.users > 0 {
            self.disk_cond.notify_one();
        }
    }

    /// True when nobody holds or awaits either phase. The evictor and the
    /// cleaner treat such pairs as fair game.
    pub(crate) fn is_idle(st: &PairState) -> bool {
        st.value_phase.idle() && st.disk_phase.idle()
    }

    /// Bumps the clock counter on a hit, saturating so one scan pass can
    /// never fully age a hot page.
    pub(crate) fn touch_with(st: &mut PairState) {
        if st.clock_count < crate::pair_list::CLOCK_SATURATION {
            st.clock_count += 1;
        }
    }
}

/// Opaque back-reference to a pair, handed to the put callback while the
/// table write lock is held so producers can record it atomically with the
/// insertion.
pub struct PairToken<V, D> {
    pub(crate) pair: Arc<Pair<V, D>>,
}

impl<V, D> PairToken<V, D> {
    pub fn filenum(&self) -> FileNum {
        self.pair.filenum()
    }

    pub fn key(&self) -> BlockNum {
        self.pair.key
    }

    pub fn fullhash(&self) -> u32 {
        self.pair.fullhash
    }
}

impl<V, D> Clone for PairToken<V, D> {
    fn clone(&self) -> Self {
        PairToken {
            pair: self.pair.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files_manager::{FileCallbacks, FilesManager};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_pair() -> Arc<Pair<Vec<u8>, ()>> {
        let dir = tempdir().unwrap();
        let fm = FilesManager::new();
        let cf = fm
            .open_file(dir.path().join("pair.db"), FileCallbacks::default())
            .unwrap();
        let callbacks = CacheCallbacks::new(Arc::new(|_ctx| Ok(None)));
        Pair::new(
            cf,
            7,
            0xdead,
            callbacks,
            Dirty::Clean,
            PairAttr::new(16),
            Some(vec![1, 2, 3]),
            None,
        )
    }

    #[test]
    fn value_phase_is_exclusive_and_counts_waiters() {
        let pair = test_pair();
        pair.lock_value();
        {
            let st = pair.state.lock();
            assert!(st.value_phase.held);
            assert_eq!(st.value_phase.users, 1);
        }

        let p2 = pair.clone();
        let waiter = thread::spawn(move || {
            p2.lock_value();
            p2.unlock_value();
        });

        // Wait until the other thread is queued on the phase.
        loop {
            let st = pair.state.lock();
            if st.value_phase.users == 2 {
                break;
            }
            drop(st);
            thread::sleep(Duration::from_millis(1));
        }

        pair.unlock_value();
        waiter.join().unwrap();
        let st = pair.state.lock();
        assert!(st.value_phase.idle());
    }

    #[test]
    fn try_lock_value_refuses_busy_pair() {
        let pair = test_pair();
        pair.lock_value();
        {
            let mut st = pair.state.lock();
            assert!(!pair.try_lock_value_with(&mut st));
        }
        pair.unlock_value();
        {
            let mut st = pair.state.lock();
            assert!(pair.try_lock_value_with(&mut st));
        }
        pair.unlock_value();
    }

    #[test]
    fn disk_phase_is_independent_of_value_phase() {
        let pair = test_pair();
        pair.lock_value();
        pair.lock_disk();
        {
            let st = pair.state.lock();
            assert!(st.value_phase.held && st.disk_phase.held);
            assert!(!Pair::<Vec<u8>, ()>::is_idle(&st));
        }
        pair.unlock_disk();
        pair.unlock_value();
        let st = pair.state.lock();
        assert!(Pair::<Vec<u8>, ()>::is_idle(&st));
    }

    #[test]
    fn default_callbacks_estimate_cheap_zero() {
        let callbacks: CacheCallbacks<Vec<u8>, ()> = CacheCallbacks::new(Arc::new(|_| Ok(None)));
        let est = (callbacks.partial_evict_estimate)(&vec![0u8; 8], None);
        assert_eq!(est.cost, EvictionCost::Cheap);
        assert_eq!(est.bytes_freed, 0);
    }
}
