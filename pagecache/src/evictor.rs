//! Evictor module — size accounting, the eviction thread, and client flow
//! control.
//!
//! All thresholds derive from one configured limit `L`:
//!
//! | threshold | value | meaning |
//! |---|---|---|
//! | low watermark | `L` | eviction goes idle below this |
//! | low hysteresis | `1.10 L` | clients stop signaling the evictor below this |
//! | high hysteresis | `1.25 L` | sleeping clients wake at or below this |
//! | high watermark | `1.50 L` | clients must sleep at or above this |
//!
//! A quarter of the limit is unreservable so bulk loaders cannot starve the
//! cache through [`Evictor::reserve_memory`].
//!
//! The eviction thread scans the clock ring: busy pairs are skipped, pairs
//! with a positive clock count are aged and offered a partial eviction
//! (inline when the client rates it cheap, on a worker when expensive), and
//! pairs that reach count zero are evicted outright. When every resident
//! pair is busy the scan remembers the first pair it could not touch and
//! exits upon coming back around to it, letting the cache run over its
//! limit rather than stalling client threads.

use crate::files_manager::FileNum;
use crate::pair::{BlockNum, Dirty, EvictionCost, FlushContext, Pair, PairAttr};
use crate::pair_list::PairList;
use crate::work_queue::WorkQueue;
use log::{error, info};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// The slice of the limit a loader may never reserve.
fn unreservable_memory(size_limit: i64) -> i64 {
    size_limit / 4
}

struct EvictorState {
    /// Bytes queued for eviction but not yet freed.
    size_evicting: i64,
    /// Unreservable floor plus client reservations; counted in
    /// `size_current`.
    size_reserved: i64,
    /// Client threads parked in [`Evictor::wait_for_cache_pressure_to_subside`].
    num_sleepers: u32,
    /// True while the eviction thread is inside a scan.
    ev_thread_running: bool,
}

/// Owns the cache's size counters and enforces the limit.
pub(crate) struct Evictor<V, D> {
    list: Arc<PairList<V, D>>,
    wq: Arc<WorkQueue>,

    size_current: AtomicI64,
    size_nonleaf: AtomicI64,
    size_leaf: AtomicI64,
    size_rollback: AtomicI64,
    size_cachepressure: AtomicI64,

    size_limit: AtomicI64,
    low_size_watermark: AtomicI64,
    low_size_hysteresis: AtomicI64,
    high_size_hysteresis: AtomicI64,
    high_size_watermark: AtomicI64,

    state: Mutex<EvictorState>,
    /// Wakes the eviction thread.
    ev_cond: Condvar,
    /// Wakes clients sleeping on cache pressure.
    flow_cond: Condvar,

    period_ms: AtomicU64,
    run_flag: AtomicBool,

    num_evictions: AtomicU64,
    num_partial_evictions: AtomicU64,
}

impl<V, D> Evictor<V, D> {
    pub(crate) fn new(
        list: Arc<PairList<V, D>>,
        wq: Arc<WorkQueue>,
        size_limit: i64,
        period: Duration,
    ) -> Arc<Self> {
        assert!(size_limit > 0, "cache size limit must be positive");
        let ev = Arc::new(Evictor {
            list,
            wq,
            size_current: AtomicI64::new(0),
            size_nonleaf: AtomicI64::new(0),
            size_leaf: AtomicI64::new(0),
            size_rollback: AtomicI64::new(0),
            size_cachepressure: AtomicI64::new(0),
            size_limit: AtomicI64::new(0),
            low_size_watermark: AtomicI64::new(0),
            low_size_hysteresis: AtomicI64::new(0),
            high_size_hysteresis: AtomicI64::new(0),
            high_size_watermark: AtomicI64::new(0),
            state: Mutex::new(EvictorState {
                size_evicting: 0,
                size_reserved: 0,
                num_sleepers: 0,
                ev_thread_running: false,
            }),
            ev_cond: Condvar::new(),
            flow_cond: Condvar::new(),
            period_ms: AtomicU64::new(period.as_millis() as u64),
            run_flag: AtomicBool::new(true),
            num_evictions: AtomicU64::new(0),
            num_partial_evictions: AtomicU64::new(0),
        });
        ev.set_size_limit(size_limit);
        ev
    }

    /// Recomputes every threshold from a new limit. Hot-swappable.
    pub(crate) fn set_size_limit(&self, size_limit: i64) {
        assert!(size_limit > 0, "cache size limit must be positive");
        let old_limit = self.size_limit.swap(size_limit, Ordering::SeqCst);
        self.low_size_watermark.store(size_limit, Ordering::SeqCst);
        self.low_size_hysteresis
            .store(11 * size_limit / 10, Ordering::SeqCst);
        self.high_size_hysteresis
            .store(5 * size_limit / 4, Ordering::SeqCst);
        self.high_size_watermark
            .store(3 * size_limit / 2, Ordering::SeqCst);
        let mut st = self.state.lock();
        st.size_reserved += unreservable_memory(size_limit) - unreservable_memory(old_limit);
    }

    pub(crate) fn set_period(&self, period: Duration) {
        self.period_ms
            .store(period.as_millis() as u64, Ordering::SeqCst);
        self.signal_eviction_thread();
    }

    // -- size accounting ----------------------------------------------

    pub(crate) fn size_current(&self) -> i64 {
        self.size_current.load(Ordering::SeqCst)
    }

    pub(crate) fn size_limit(&self) -> i64 {
        self.size_limit.load(Ordering::SeqCst)
    }

    pub(crate) fn num_evictions(&self) -> u64 {
        self.num_evictions.load(Ordering::SeqCst)
    }

    pub(crate) fn num_partial_evictions(&self) -> u64 {
        self.num_partial_evictions.load(Ordering::SeqCst)
    }

    pub(crate) fn add_size_current(&self, bytes: i64) {
        self.size_current.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn sub_size_current(&self, bytes: i64) {
        let prev = self.size_current.fetch_sub(bytes, Ordering::SeqCst);
        assert!(prev >= bytes, "size_current underflow");
    }

    /// Accounts a freshly resident pair.
    pub(crate) fn add_pair_attr(&self, attr: PairAttr) {
        self.add_size_current(attr.size);
        self.size_nonleaf.fetch_add(attr.nonleaf_size, Ordering::SeqCst);
        self.size_leaf.fetch_add(attr.leaf_size, Ordering::SeqCst);
        self.size_rollback.fetch_add(attr.rollback_size, Ordering::SeqCst);
        self.size_cachepressure
            .fetch_add(attr.cache_pressure_size, Ordering::SeqCst);
    }

    pub(crate) fn remove_pair_attr(&self, attr: PairAttr) {
        self.sub_size_current(attr.size);
        self.size_nonleaf.fetch_sub(attr.nonleaf_size, Ordering::SeqCst);
        self.size_leaf.fetch_sub(attr.leaf_size, Ordering::SeqCst);
        self.size_rollback.fetch_sub(attr.rollback_size, Ordering::SeqCst);
        self.size_cachepressure
            .fetch_sub(attr.cache_pressure_size, Ordering::SeqCst);
    }

    pub(crate) fn change_pair_attr(&self, old: PairAttr, new: PairAttr) {
        self.add_pair_attr(new);
        self.remove_pair_attr(old);
    }

    // -- pressure predicates ------------------------------------------

    /// The cache is so oversubscribed that a client thread should sleep.
    /// Sleeping starts at the high watermark exactly.
    pub(crate) fn should_client_thread_sleep(&self) -> bool {
        self.size_current() >= self.high_size_watermark.load(Ordering::SeqCst)
    }

    /// Sleeping clients may wake again.
    fn should_sleeping_clients_wakeup(&self) -> bool {
        self.size_current() <= self.high_size_hysteresis.load(Ordering::SeqCst)
    }

    /// A client noticing growth should prod the eviction thread.
    pub(crate) fn should_client_wake_eviction_thread(&self) -> bool {
        let st = self.state.lock();
        !st.ev_thread_running
            && self.size_current() - st.size_evicting
                > self.low_size_hysteresis.load(Ordering::SeqCst)
    }

    fn eviction_needed(&self, st: &EvictorState) -> bool {
        self.size_current() - st.size_evicting > self.low_size_watermark.load(Ordering::SeqCst)
    }

    pub(crate) fn signal_eviction_thread(&self) {
        self.ev_cond.notify_one();
    }

    /// Parks the calling client until the evictor broadcasts that pressure
    /// has subsided.
    pub(crate) fn wait_for_cache_pressure_to_subside(&self) {
        let mut st = self.state.lock();
        st.num_sleepers += 1;
        self.signal_eviction_thread();
        self.flow_cond.wait(&mut st);
        st.num_sleepers -= 1;
    }

    /// Accounts `est` bytes as queued-for-eviction. Runs outside the scan
    /// loop's lock, on whichever thread queued the work.
    fn increase_size_evicting(&self, pair: &Pair<V, D>, est: i64) {
        pair.state.lock().size_evicting_estimate = est;
        let mut st = self.state.lock();
        st.size_evicting += est;
    }

    /// Gives back `est` queued bytes, waking the eviction thread when the
    /// backlog drains below the hysteresis buffer while clients sleep: at
    /// that point either the sleepers can be woken or more evictions must
    /// be queued, and both are the eviction thread's job.
    fn decrease_size_evicting(&self, est: i64) {
        if est <= 0 {
            return;
        }
        let mut st = self.state.lock();
        let buffer = self.high_size_hysteresis.load(Ordering::SeqCst)
            - self.low_size_watermark.load(Ordering::SeqCst);
        let need_signal = st.num_sleepers > 0
            && !st.ev_thread_running
            && st.size_evicting > buffer
            && st.size_evicting - est <= buffer;
        st.size_evicting -= est;
        assert!(st.size_evicting >= 0, "size_evicting underflow");
        if need_signal {
            self.signal_eviction_thread();
        }
    }

    // -- loader reservations ------------------------------------------

    /// Atomically reserves `fraction` of the still-reservable limit for a
    /// bulk loader. The reservation counts toward `size_current`, so it may
    /// put the cache under pressure and block behind eviction.
    pub(crate) fn reserve_memory(&self, fraction: f64) -> i64 {
        let reserved = {
            let mut st = self.state.lock();
            let reservable = self.low_size_watermark.load(Ordering::SeqCst) - st.size_reserved;
            let reserved = (fraction * reservable.max(0) as f64) as i64;
            st.size_reserved += reserved;
            reserved
        };
        self.add_size_current(reserved);
        if self.should_client_wake_eviction_thread() {
            self.signal_eviction_thread();
        }
        if self.should_client_thread_sleep() {
            self.wait_for_cache_pressure_to_subside();
        }
        reserved
    }

    pub(crate) fn release_reserved_memory(&self, reserved: i64) {
        self.sub_size_current(reserved);
        let mut st = self.state.lock();
        st.size_reserved -= reserved;
    }

    pub(crate) fn stop(&self) {
        self.run_flag.store(false, Ordering::SeqCst);
        self.ev_cond.notify_all();
        // Nobody will evict for them anymore.
        self.flow_cond.notify_all();
    }
}

// The eviction thread and everything that dispatches work to the queues.
impl<V: Send + 'static, D: Send + 'static> Evictor<V, D> {
    pub(crate) fn spawn(ev: Arc<Self>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("pagecache-evictor".into())
            .spawn(move || Self::run(&ev))
            .expect("failed to spawn eviction thread")
    }

    fn run(ev: &Arc<Self>) {
        info!("Starting eviction thread");
        let mut st = ev.state.lock();
        while ev.run_flag.load(Ordering::SeqCst) {
            // Even a pass with nothing to evict must run: its exit path
            // wakes clients sleeping on pressure that has since subsided.
            st.ev_thread_running = true;
            Self::run_eviction(ev, &mut st);
            st.ev_thread_running = false;
            if !ev.run_flag.load(Ordering::SeqCst) {
                break;
            }
            let period = ev.period_ms.load(Ordering::SeqCst);
            if period > 0 {
                ev.ev_cond.wait_for(&mut st, Duration::from_millis(period));
            } else {
                ev.ev_cond.wait(&mut st);
            }
        }
        drop(st);
        info!("Eviction thread exiting");
    }

    /// One full eviction pass. Entered and left with the evictor state
    /// lock held; released around each pair so clients are never blocked
    /// behind the scan.
    fn run_eviction(ev: &Arc<Self>, st: &mut MutexGuard<'_, EvictorState>) {
        let mut cycle_key: Option<(FileNum, BlockNum)> = None;
        let mut exited_early = false;
        loop {
            if !ev.eviction_needed(st) {
                break;
            }
            if st.num_sleepers > 0 && ev.should_sleeping_clients_wakeup() {
                ev.flow_cond.notify_all();
            }
            let keep_going = MutexGuard::unlocked(st, || {
                let (idx, pair) = {
                    let inner = ev.list.inner.read();
                    match ev.list.clock_head_pair(&inner) {
                        Some(found) => found,
                        None => return false,
                    }
                };
                if cycle_key == Some((pair.filenum(), pair.key())) {
                    // Everything in the clock is in use; let memory run
                    // over rather than spin.
                    return false;
                }
                let progress = Self::run_eviction_on_pair(ev, &pair);
                if progress {
                    cycle_key = None;
                } else if cycle_key.is_none() {
                    cycle_key = Some((pair.filenum(), pair.key()));
                }
                let inner = ev.list.inner.read();
                ev.list.advance_clock_head_from(&inner, idx, &pair);
                true
            });
            if !keep_going {
                exited_early = true;
                break;
            }
        }
        if st.num_sleepers > 0 && (exited_early || ev.should_sleeping_clients_wakeup()) {
            ev.flow_cond.notify_all();
        }
    }

    /// Ages or evicts one pair. Returns false when the pair could not be
    /// touched at all (busy, or its file is draining).
    fn run_eviction_on_pair(ev: &Arc<Self>, pair: &Arc<Pair<V, D>>) -> bool {
        let cf = pair.cachefile.clone();
        if !cf.jobs.add_job() {
            // The file is being closed out from under us.
            return false;
        }
        let mut st = pair.state.lock();
        if !Pair::<V, D>::is_idle(&st) {
            drop(st);
            cf.jobs.remove_job();
            return false;
        }

        if st.clock_count > 0 {
            st.clock_count -= 1;
            let locked = pair.try_lock_value_with(&mut st);
            assert!(locked, "idle pair must lock immediately");
            drop(st);

            let est = {
                let vcell = pair.value.lock();
                let dcell = pair.disk.lock();
                (pair.callbacks.partial_evict_estimate)(
                    vcell.as_ref().unwrap(),
                    dcell.disk_data.as_ref(),
                )
            };
            match est.cost {
                EvictionCost::Cheap => {
                    pair.state.lock().size_evicting_estimate = 0;
                    ev.do_partial_eviction(pair);
                    cf.jobs.remove_job();
                }
                EvictionCost::Expensive if est.bytes_freed > 0 => {
                    ev.increase_size_evicting(pair, est.bytes_freed);
                    let worker_ev = ev.clone();
                    let worker_pair = pair.clone();
                    ev.wq.enqueue(move || {
                        worker_ev.do_partial_eviction(&worker_pair);
                        worker_pair.cachefile.jobs.remove_job();
                    });
                }
                EvictionCost::Expensive => {
                    // Nothing to gain; do not bother a worker.
                    pair.unlock_value();
                    cf.jobs.remove_job();
                }
            }
        } else {
            Self::try_evict_pair(ev, pair, st);
        }
        true
    }

    /// Shrinks the value in place via the client's partial-eviction
    /// callback. The value phase is held on entry and released here.
    fn do_partial_eviction(&self, pair: &Arc<Pair<V, D>>) {
        let old_attr = pair.state.lock().attr;
        let new_attr = {
            let mut vcell = pair.value.lock();
            (pair.callbacks.partial_evict)(vcell.as_mut().unwrap(), old_attr)
        };
        let est = {
            let mut st = pair.state.lock();
            if new_attr.is_valid {
                st.attr = new_attr;
            }
            std::mem::replace(&mut st.size_evicting_estimate, 0)
        };
        if new_attr.is_valid {
            self.change_pair_attr(old_attr, new_attr);
        }
        self.decrease_size_evicting(est);
        pair.unlock_value();
        self.num_partial_evictions.fetch_add(1, Ordering::SeqCst);
    }

    /// Full eviction of a pair whose clock count hit zero. A clean pair
    /// with a free disk phase is removed on the calling thread; anything
    /// else goes to a worker because it involves a write or a wait.
    /// Takes over the background job registered by the caller.
    fn try_evict_pair(
        ev: &Arc<Self>,
        pair: &Arc<Pair<V, D>>,
        mut st: MutexGuard<'_, crate::pair::PairState>,
    ) {
        let locked = pair.try_lock_value_with(&mut st);
        assert!(locked, "idle pair must lock immediately");
        let clean_and_quiet = !st.dirty.is_dirty() && st.disk_phase.idle();
        if clean_and_quiet {
            st.size_evicting_estimate = 0;
            drop(st);
            ev.evict_pair(pair, false);
            pair.cachefile.jobs.remove_job();
        } else {
            let est = st.attr.size;
            drop(st);
            ev.increase_size_evicting(pair, est);
            let worker_ev = ev.clone();
            let worker_pair = pair.clone();
            ev.wq.enqueue(move || {
                let pending = worker_ev.list.take_checkpoint_pending(&worker_pair);
                worker_ev.evict_pair(&worker_pair, pending);
                worker_pair.cachefile.jobs.remove_job();
            });
        }
    }
}

// Write-back and destruction paths; shared with the checkpointer, the
// façade's flush, and pin guards.
impl<V, D> Evictor<V, D> {
    /// Writes the pair out if dirty, then removes and frees it unless a
    /// late arrival is already waiting on its locks (in which case the
    /// pair stays resident, now clean). The value phase is held on entry.
    pub(crate) fn evict_pair(&self, pair: &Arc<Pair<V, D>>, for_checkpoint: bool) {
        if pair.state.lock().dirty.is_dirty() {
            if let Err(e) = self.write_locked_pair(pair, for_checkpoint) {
                error!(
                    "fatal: failed to write page (filenum {}, key {}) during eviction: {e}",
                    pair.filenum(),
                    pair.key()
                );
                std::process::abort();
            }
        }
        let est = {
            let mut st = pair.state.lock();
            std::mem::replace(&mut st.size_evicting_estimate, 0)
        };
        self.decrease_size_evicting(est);

        pair.lock_disk();
        let mut inner = self.list.inner.write();
        let can_free = {
            let mut st = pair.state.lock();
            pair.unlock_value_with(&mut st);
            pair.unlock_disk_with(&mut st);
            // A pair already taken out by a remove or a file flush has
            // nothing left to evict.
            Pair::<V, D>::is_idle(&st) && !st.removed
        };
        if can_free {
            self.list.remove(&mut inner, pair);
            drop(inner);
            self.free_pair(pair);
            self.num_evictions.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Serializes the live value through the flush callback, marking the
    /// pair clean. The value phase is held on entry; the disk phase is
    /// taken around the write.
    pub(crate) fn write_locked_pair(
        &self,
        pair: &Arc<Pair<V, D>>,
        for_checkpoint: bool,
    ) -> std::io::Result<()> {
        pair.lock_disk();
        let result = self.write_pair_data(pair, for_checkpoint, false);
        pair.unlock_disk();
        result
    }

    /// The one place flush callbacks run for live values and checkpoint
    /// clones alike. For clones (`is_clone`), the disk phase alone is
    /// held and the clone is consumed; otherwise both phases are held.
    pub(crate) fn write_pair_data(
        &self,
        pair: &Arc<Pair<V, D>>,
        for_checkpoint: bool,
        is_clone: bool,
    ) -> std::io::Result<()> {
        let fd = pair.cachefile.fd();
        if is_clone {
            let mut dcell = pair.disk.lock();
            let crate::pair::DiskCell {
                disk_data,
                cloned_value,
            } = &mut *dcell;
            let mut clone_v = cloned_value.take().expect("clone write without a clone");
            let attr = pair.state.lock().attr;
            (pair.callbacks.flush)(FlushContext {
                fd,
                filenum: pair.filenum(),
                key: pair.key(),
                value: &mut clone_v,
                disk_data,
                attr,
                do_write: true,
                keep: false,
                for_checkpoint,
                is_clone: true,
            })?;
            drop(dcell);
            let cloned_size = {
                let mut st = pair.state.lock();
                std::mem::replace(&mut st.cloned_size, 0)
            };
            self.sub_size_current(cloned_size);
            Ok(())
        } else {
            let mut vcell = pair.value.lock();
            let mut dcell = pair.disk.lock();
            let old_attr = pair.state.lock().attr;
            let new_attr = (pair.callbacks.flush)(FlushContext {
                fd,
                filenum: pair.filenum(),
                key: pair.key(),
                value: vcell.as_mut().expect("flushing a pair with no value"),
                disk_data: &mut dcell.disk_data,
                attr: old_attr,
                do_write: true,
                keep: true,
                for_checkpoint,
                is_clone: false,
            })?;
            drop(dcell);
            drop(vcell);
            let mut st = pair.state.lock();
            st.dirty = Dirty::Clean;
            if let Some(attr) = new_attr {
                if attr.is_valid {
                    st.attr = attr;
                    drop(st);
                    self.change_pair_attr(old_attr, attr);
                }
            }
            Ok(())
        }
    }

    /// Destroys a pair that has already left the table: announces the
    /// destruction to the client (flush with `keep == false`), drops the
    /// value, and gives its sizes back. Idempotent via the value `take`.
    pub(crate) fn free_pair(&self, pair: &Arc<Pair<V, D>>) {
        let mut vcell = pair.value.lock();
        let mut dcell = pair.disk.lock();
        assert!(
            dcell.cloned_value.is_none(),
            "freeing a pair with a clone in flight"
        );
        let Some(mut value) = vcell.take() else {
            return;
        };
        let attr = pair.state.lock().attr;
        if let Err(e) = (pair.callbacks.flush)(FlushContext {
            fd: pair.cachefile.fd(),
            filenum: pair.filenum(),
            key: pair.key(),
            value: &mut value,
            disk_data: &mut dcell.disk_data,
            attr,
            do_write: false,
            keep: false,
            for_checkpoint: false,
            is_clone: false,
        }) {
            error!(
                "flush callback failed while freeing page (filenum {}, key {}): {e}",
                pair.filenum(),
                pair.key()
            );
        }
        dcell.disk_data = None;
        drop(dcell);
        drop(vcell);
        self.remove_pair_attr(attr);
    }
}
