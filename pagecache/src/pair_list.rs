//! PairList module — the resident set: hash table, clock ring, and the
//! pending-checkpoint set.
//!
//! The table is open-chained over a power-of-two bucket array, sized up
//! when the load factor passes 1 and down when it falls under a quarter.
//! Pairs live in arena slots linked by explicit `u32` indices: one link for
//! the bucket chain and a doubly linked ring through every resident pair
//! that the evictor's clock hand and the cleaner's head both traverse. All
//! of that sits behind one reader/writer lock; the two head cursors are
//! atomics so their owning threads can advance them under the read lock.
//!
//! The pending-checkpoint set is kept apart under the split pending locks:
//! the *expensive* lock is held across begin-checkpoint and across
//! dependent-pin windows, the *cheap* lock only for bit transitions, and
//! the set itself is sharded so unpins clearing pending bits on different
//! pairs do not contend.

use crate::files_manager::FileNum;
use crate::pair::{BlockNum, Pair};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Clock counters saturate here; one scan pass cannot fully age a hot page.
pub(crate) const CLOCK_SATURATION: u8 = 15;
/// Counter given to a pair on insertion.
pub(crate) const CLOCK_INITIAL_COUNT: u8 = 3;

/// Sentinel slot index for "no slot".
pub(crate) const NIL: u32 = u32::MAX;

const INITIAL_BUCKETS: usize = 4;

/// The bucketing hash over `(filenum, key)`. Clients compute it once per
/// operation and pass it in; the cached copy on the pair survives rehashes.
pub fn full_hash(filenum: FileNum, key: BlockNum) -> u32 {
    let mut hasher = DefaultHasher::new();
    filenum.hash(&mut hasher);
    key.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

pub(crate) struct PairSlot<V, D> {
    pub pair: Arc<Pair<V, D>>,
    hash_chain: u32,
    pub clock_next: u32,
    pub clock_prev: u32,
}

/// Everything behind the table lock.
pub(crate) struct PairListInner<V, D> {
    slots: Vec<Option<PairSlot<V, D>>>,
    free_slots: Vec<u32>,
    buckets: Vec<u32>,
    n_pairs: u32,
}

impl<V, D> PairListInner<V, D> {
    fn new() -> Self {
        PairListInner {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![NIL; INITIAL_BUCKETS],
            n_pairs: 0,
        }
    }

    fn bucket_of(&self, fullhash: u32) -> usize {
        (fullhash as usize) & (self.buckets.len() - 1)
    }

    pub(crate) fn n_pairs(&self) -> u32 {
        self.n_pairs
    }

    pub(crate) fn slot(&self, idx: u32) -> Option<&PairSlot<V, D>> {
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    /// Looks a pair up by key. O(chain length).
    pub(crate) fn find(
        &self,
        filenum: FileNum,
        key: BlockNum,
        fullhash: u32,
    ) -> Option<Arc<Pair<V, D>>> {
        let mut idx = self.buckets[self.bucket_of(fullhash)];
        while idx != NIL {
            let slot = self.slots[idx as usize].as_ref().unwrap();
            if slot.pair.key() == key && slot.pair.filenum() == filenum {
                return Some(slot.pair.clone());
            }
            idx = slot.hash_chain;
        }
        None
    }

    /// Every resident pair, in arena order. Iteration order is unspecified
    /// to callers.
    pub(crate) fn pairs(&self) -> impl Iterator<Item = &Arc<Pair<V, D>>> {
        self.slots.iter().filter_map(|s| s.as_ref()).map(|s| &s.pair)
    }

    fn alloc_slot(&mut self, slot: PairSlot<V, D>) -> u32 {
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Rebuilds the bucket array at `new_size` (a power of two), reusing
    /// the fullhash cached on each pair.
    fn rehash(&mut self, new_size: usize) {
        assert!(new_size >= INITIAL_BUCKETS && new_size.is_power_of_two());
        self.buckets = vec![NIL; new_size];
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_none() {
                continue;
            }
            let fullhash = self.slots[idx].as_ref().unwrap().pair.fullhash;
            let bucket = self.bucket_of(fullhash);
            let head = self.buckets[bucket];
            self.slots[idx].as_mut().unwrap().hash_chain = head;
            self.buckets[bucket] = idx as u32;
        }
    }
}

/// The resident set with its table lock, clock cursors, and pending set.
pub(crate) struct PairList<V, D> {
    pub(crate) inner: RwLock<PairListInner<V, D>>,
    /// Slot the evictor's clock hand points at; advanced by the eviction
    /// thread under the read lock, repaired by removals under the write
    /// lock.
    pub(crate) clock_head: AtomicU32,
    /// The cleaner's own cursor over the same ring.
    pub(crate) cleaner_head: AtomicU32,
    /// Pairs whose `checkpoint_pending` bit is set, keyed by
    /// `(filenum, key)`.
    pub(crate) pending: DashMap<(FileNum, BlockNum), Arc<Pair<V, D>>>,
    /// Held for write across begin-checkpoint, for read across
    /// dependent-pin windows.
    pub(crate) pending_expensive: RwLock<()>,
    /// Held for write while begin-checkpoint sets pending bits, for read
    /// by anyone clearing one.
    pub(crate) pending_cheap: RwLock<()>,
}

impl<V, D> PairList<V, D> {
    pub(crate) fn new() -> Self {
        PairList {
            inner: RwLock::new(PairListInner::new()),
            clock_head: AtomicU32::new(NIL),
            cleaner_head: AtomicU32::new(NIL),
            pending: DashMap::new(),
            pending_expensive: RwLock::new(()),
            pending_cheap: RwLock::new(()),
        }
    }

    /// Adds `pair` to its bucket and to the clock ring, just behind the
    /// clock head (the "tail" of the ring). Requires the table write lock.
    pub(crate) fn insert(&self, inner: &mut PairListInner<V, D>, pair: Arc<Pair<V, D>>) {
        {
            let mut st = pair.state.lock();
            st.clock_count = CLOCK_INITIAL_COUNT;
        }
        let bucket = inner.bucket_of(pair.fullhash);
        let chain_head = inner.buckets[bucket];
        let idx = inner.alloc_slot(PairSlot {
            pair: pair.clone(),
            hash_chain: chain_head,
            clock_next: NIL,
            clock_prev: NIL,
        });
        inner.buckets[bucket] = idx;
        pair.slot.store(idx, Ordering::Release);

        let head = self.clock_head.load(Ordering::Acquire);
        if head == NIL {
            // First element: a ring of one.
            let slot = inner.slots[idx as usize].as_mut().unwrap();
            slot.clock_next = idx;
            slot.clock_prev = idx;
            self.clock_head.store(idx, Ordering::Release);
            self.cleaner_head.store(idx, Ordering::Release);
        } else {
            let prev = inner.slots[head as usize].as_ref().unwrap().clock_prev;
            {
                let slot = inner.slots[idx as usize].as_mut().unwrap();
                slot.clock_next = head;
                slot.clock_prev = prev;
            }
            inner.slots[prev as usize].as_mut().unwrap().clock_next = idx;
            inner.slots[head as usize].as_mut().unwrap().clock_prev = idx;
        }

        inner.n_pairs += 1;
        if inner.n_pairs as usize > inner.buckets.len() {
            let new_size = inner.buckets.len() * 2;
            inner.rehash(new_size);
        }
    }

    /// Removes `pair` from the bucket chain, the clock ring, and the
    /// pending set, marks it removed, and wakes any thread parked on its
    /// phased locks. Requires the table write lock.
    pub(crate) fn remove(&self, inner: &mut PairListInner<V, D>, pair: &Arc<Pair<V, D>>) {
        let idx = pair.slot.load(Ordering::Acquire);
        assert_ne!(idx, NIL, "removing a pair that is not in the table");

        // Bucket chain.
        let bucket = inner.bucket_of(pair.fullhash);
        let mut cur = inner.buckets[bucket];
        if cur == idx {
            inner.buckets[bucket] = inner.slots[idx as usize].as_ref().unwrap().hash_chain;
        } else {
            while cur != NIL {
                let next = inner.slots[cur as usize].as_ref().unwrap().hash_chain;
                if next == idx {
                    let after = inner.slots[idx as usize].as_ref().unwrap().hash_chain;
                    inner.slots[cur as usize].as_mut().unwrap().hash_chain = after;
                    break;
                }
                cur = next;
            }
            assert_ne!(cur, NIL, "pair missing from its bucket chain");
        }

        // Clock ring, repairing the cursors if they point here.
        let (next, prev) = {
            let slot = inner.slots[idx as usize].as_ref().unwrap();
            (slot.clock_next, slot.clock_prev)
        };
        if next == idx {
            self.clock_head.store(NIL, Ordering::Release);
            self.cleaner_head.store(NIL, Ordering::Release);
        } else {
            inner.slots[prev as usize].as_mut().unwrap().clock_next = next;
            inner.slots[next as usize].as_mut().unwrap().clock_prev = prev;
            if self.clock_head.load(Ordering::Acquire) == idx {
                self.clock_head.store(next, Ordering::Release);
            }
            if self.cleaner_head.load(Ordering::Acquire) == idx {
                self.cleaner_head.store(next, Ordering::Release);
            }
        }

        // Pending set and bit.
        {
            let _cheap = self.pending_cheap.read();
            let mut st = pair.state.lock();
            st.checkpoint_pending = false;
            st.removed = true;
            pair.value_cond.notify_all();
            pair.disk_cond.notify_all();
        }
        self.pending.remove(&(pair.filenum(), pair.key()));

        inner.slots[idx as usize] = None;
        inner.free_slots.push(idx);
        pair.slot.store(NIL, Ordering::Release);

        assert!(inner.n_pairs > 0);
        inner.n_pairs -= 1;
        if 4 * (inner.n_pairs as usize) < inner.buckets.len() && inner.buckets.len() > INITIAL_BUCKETS
        {
            let new_size = inner.buckets.len() / 2;
            inner.rehash(new_size);
        }
    }

    /// The pair under the clock hand, if any. Requires the table read lock.
    pub(crate) fn clock_head_pair(
        &self,
        inner: &PairListInner<V, D>,
    ) -> Option<(u32, Arc<Pair<V, D>>)> {
        let idx = self.clock_head.load(Ordering::Acquire);
        if idx == NIL {
            return None;
        }
        Some((idx, inner.slot(idx)?.pair.clone()))
    }

    /// Moves the clock hand one step, if `idx` is still under it and still
    /// holds `pair` (a removal may have reused the slot meanwhile). Only
    /// the eviction thread calls this, under the table read lock.
    pub(crate) fn advance_clock_head_from(
        &self,
        inner: &PairListInner<V, D>,
        idx: u32,
        pair: &Arc<Pair<V, D>>,
    ) {
        if self.clock_head.load(Ordering::Acquire) == idx {
            if let Some(slot) = inner.slot(idx) {
                if Arc::ptr_eq(&slot.pair, pair) {
                    self.clock_head.store(slot.clock_next, Ordering::Release);
                }
            }
        }
    }

    pub(crate) fn cleaner_head_pair(
        &self,
        inner: &PairListInner<V, D>,
    ) -> Option<(u32, Arc<Pair<V, D>>)> {
        let idx = self.cleaner_head.load(Ordering::Acquire);
        if idx == NIL {
            return None;
        }
        Some((idx, inner.slot(idx)?.pair.clone()))
    }

    /// Moves the cleaner head one step. Only the cleaner thread calls
    /// this, under the table read lock.
    pub(crate) fn advance_cleaner_head_from(
        &self,
        inner: &PairListInner<V, D>,
        idx: u32,
        pair: &Arc<Pair<V, D>>,
    ) {
        if self.cleaner_head.load(Ordering::Acquire) == idx {
            if let Some(slot) = inner.slot(idx) {
                if Arc::ptr_eq(&slot.pair, pair) {
                    self.cleaner_head.store(slot.clock_next, Ordering::Release);
                }
            }
        }
    }

    /// Reads and clears the pair's checkpoint-pending bit under the cheap
    /// pending lock, dropping it from the pending set. Returns the old
    /// bit; a `true` makes the caller responsible for writing the pair out
    /// for the checkpoint in progress.
    pub(crate) fn take_checkpoint_pending(&self, pair: &Pair<V, D>) -> bool {
        let _cheap = self.pending_cheap.read();
        let was_pending = {
            let mut st = pair.state.lock();
            std::mem::replace(&mut st.checkpoint_pending, false)
        };
        if was_pending {
            self.pending.remove(&(pair.filenum(), pair.key()));
        }
        was_pending
    }
}
