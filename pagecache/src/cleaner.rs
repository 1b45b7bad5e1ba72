//! Cleaner module — periodic background reshaping of the hottest pages.
//!
//! Each cycle runs up to a configured number of iterations. An iteration
//! walks at most [`CLEANER_N_TO_CHECK`] unpinned pairs from the cleaner's
//! own ring cursor, picks the one with the highest cache-pressure score,
//! services any pending checkpoint write it carries, and hands an
//! exclusively pinned page to the client's cleaner callback (typically to
//! flush buffered messages down toward the leaves). Pairs scoring zero are
//! never selected; that is how leaves and rollback pages opt out.

use crate::checkpointer::Checkpointer;
use crate::evictor::Evictor;
use crate::pair::Pair;
use crate::pair_list::PairList;
use crate::work_queue::WorkerHandle;
use crate::cache::PinnedPage;
use crossbeam::channel;
use log::{error, info};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on pairs examined per iteration.
const CLEANER_N_TO_CHECK: u32 = 8;

pub(crate) struct Cleaner<V, D> {
    list: Arc<PairList<V, D>>,
    ev: Arc<Evictor<V, D>>,
    cp: Arc<Checkpointer<V, D>>,
    iterations: AtomicU32,
    period_ms: AtomicU64,
    executions: AtomicU64,
}

impl<V: Send + 'static, D: Send + 'static> Cleaner<V, D> {
    pub(crate) fn new(
        list: Arc<PairList<V, D>>,
        ev: Arc<Evictor<V, D>>,
        cp: Arc<Checkpointer<V, D>>,
        period: Duration,
        iterations: u32,
    ) -> Arc<Self> {
        Arc::new(Cleaner {
            list,
            ev,
            cp,
            iterations: AtomicU32::new(iterations),
            period_ms: AtomicU64::new(period.as_millis() as u64),
            executions: AtomicU64::new(0),
        })
    }

    pub(crate) fn set_period(&self, period: Duration) {
        self.period_ms
            .store(period.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_iterations(&self, iterations: u32) {
        self.iterations.store(iterations, Ordering::SeqCst);
    }

    pub(crate) fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// One cleaner cycle. Returns how many pairs were handed to the
    /// cleaner callback.
    pub(crate) fn run_cleaner(&self) -> usize {
        let mut cleaned = 0;
        let iterations = self.iterations.load(Ordering::SeqCst);
        for _ in 0..iterations {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let Some(best) = self.pick_candidate() else {
                // An empty scan now will be an empty scan all cycle.
                break;
            };
            if self.clean_pair(&best) {
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Scans from the cleaner head for the unpinned pair with the highest
    /// positive cache-pressure score, advancing the head as it goes.
    fn pick_candidate(&self) -> Option<Arc<Pair<V, D>>> {
        let inner = self.list.inner.read();
        let (first_idx, _) = self.list.cleaner_head_pair(&inner)?;
        let mut best: Option<(i64, Arc<Pair<V, D>>)> = None;
        let mut n_seen = 0;
        let mut cur_idx = first_idx;
        loop {
            let Some(slot) = inner.slot(cur_idx) else {
                break;
            };
            let pair = &slot.pair;
            let next_idx = slot.clock_next;
            {
                let st = pair.state.lock();
                if st.value_phase.idle() {
                    n_seen += 1;
                    // No cleaner callback means nothing to clean, same as
                    // a zero score.
                    let score = if pair.callbacks.cleaner.is_some() {
                        st.attr.cache_pressure_size
                    } else {
                        0
                    };
                    let best_score = best.as_ref().map_or(0, |(s, _)| *s);
                    if score > best_score {
                        best = Some((score, pair.clone()));
                    }
                }
            }
            self.list.advance_cleaner_head_from(&inner, cur_idx, pair);
            cur_idx = next_idx;
            if cur_idx == first_idx || n_seen >= CLEANER_N_TO_CHECK {
                break;
            }
        }
        best.map(|(_, pair)| pair)
    }

    /// Pins the candidate, services its checkpoint obligation, re-checks
    /// the score, and invokes the cleaner callback. Returns whether the
    /// callback ran.
    fn clean_pair(&self, pair: &Arc<Pair<V, D>>) -> bool {
        // Keep the file alive across the callback; a draining file makes
        // this iteration a no-op.
        if !pair.cachefile.jobs.add_job() {
            return false;
        }
        {
            let mut st = pair.state.lock();
            if st.removed || !st.value_phase.idle() {
                drop(st);
                pair.cachefile.jobs.remove_job();
                return false;
            }
            let locked = pair.try_lock_value_with(&mut st);
            assert!(locked, "idle pair must lock immediately");
        }

        let pending = self.list.take_checkpoint_pending(pair);
        if pending {
            if let Err(e) = self.cp.write_locked_pair_for_checkpoint(pair, true) {
                error!(
                    "fatal: checkpoint write from cleaner failed (filenum {}, key {}): {e}",
                    pair.filenum(),
                    pair.key()
                );
                std::process::abort();
            }
        }

        // Servicing the checkpoint may have discharged whatever pressure
        // the pair carried.
        let score = pair.state.lock().attr.cache_pressure_size;
        let ran = if score > 0 {
            let cb = pair
                .callbacks
                .cleaner
                .clone()
                .expect("candidate without a cleaner callback");
            let pin = PinnedPage::adopt(
                pair.clone(),
                self.ev.clone(),
                self.list.clone(),
                true,
            );
            if let Err(e) = cb(pin) {
                error!(
                    "fatal: cleaner callback failed (filenum {}, key {}): {e}",
                    pair.filenum(),
                    pair.key()
                );
                std::process::abort();
            }
            true
        } else {
            pair.unlock_value();
            false
        };
        pair.cachefile.jobs.remove_job();
        ran
    }

    /// Spawns the periodic cleaner thread. A zero period parks it;
    /// cycles can still be run manually.
    pub(crate) fn spawn(cleaner: Arc<Self>) -> WorkerHandle {
        let (tx, rx) = channel::unbounded::<()>();
        let handle = thread::Builder::new()
            .name("pagecache-cleaner".into())
            .spawn(move || {
                info!("Starting cleaner thread");
                loop {
                    let period = cleaner.period_ms.load(Ordering::SeqCst);
                    let tick = if period == 0 {
                        Duration::from_millis(500)
                    } else {
                        Duration::from_millis(period)
                    };
                    match rx.recv_timeout(tick) {
                        Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => {
                            info!("Shutting down cleaner thread");
                            break;
                        }
                        Err(channel::RecvTimeoutError::Timeout) => {
                            if period > 0 {
                                cleaner.run_cleaner();
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn cleaner thread");
        WorkerHandle::new(handle, tx)
    }
}
