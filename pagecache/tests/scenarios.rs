//! End-to-end scenarios driving the cache through its public API: hits,
//! misses, flushes, size-triggered eviction, checkpoint clones, dependent
//! pins, cleaner selection, and close under load.

use pagecache::{
    full_hash, BlockNum, Cache, CacheCallbacks, CacheError, CacheOptions, CheckpointLogger,
    CleanerFn, CloneFn, DependentPin, Dirty, FetchHooks, FetchedPage, FileCallbacks, Lsn, PairAttr,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

type TestCache = Cache<Vec<u8>, ()>;

/// In-memory stand-in for the on-disk page format, which belongs to the
/// client callbacks, not the cache.
#[derive(Default)]
struct Backing {
    pages: Mutex<HashMap<BlockNum, Vec<u8>>>,
    /// (key, for_checkpoint) for every flush that asked for a write.
    write_log: Mutex<Vec<(BlockNum, bool)>>,
    fetches: AtomicUsize,
}

impl Backing {
    fn writes(&self) -> usize {
        self.write_log.lock().len()
    }

    fn written_keys(&self) -> Vec<BlockNum> {
        self.write_log.lock().iter().map(|(k, _)| *k).collect()
    }
}

fn make_callbacks(backing: &Arc<Backing>) -> CacheCallbacks<Vec<u8>, ()> {
    let b = backing.clone();
    CacheCallbacks::new(Arc::new(move |ctx| {
        if ctx.do_write {
            b.write_log.lock().push((ctx.key, ctx.for_checkpoint));
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

struct Rig {
    _dir: TempDir,
    cache: Arc<TestCache>,
    cf: Arc<pagecache::CacheFile>,
    backing: Arc<Backing>,
    callbacks: CacheCallbacks<Vec<u8>, ()>,
    hooks: FetchHooks<Vec<u8>, ()>,
}

fn rig(options: CacheOptions, logger: Option<Arc<dyn CheckpointLogger>>) -> Rig {
    let dir = TempDir::new().unwrap();
    let cache = TestCache::new(options, logger);
    let cf = cache
        .open_file(dir.path().join("f1.db"), FileCallbacks::default())
        .unwrap();
    let backing = Arc::new(Backing::default());
    let callbacks = make_callbacks(&backing);
    let hooks = make_hooks(&backing);
    Rig {
        _dir: dir,
        cache,
        cf,
        backing,
        callbacks,
        hooks,
    }
}

fn manual_options(size_limit: i64) -> CacheOptions {
    CacheOptions {
        size_limit,
        eviction_period: Duration::from_millis(50),
        checkpoint_period: Duration::from_secs(0),
        cleaner_period: Duration::from_secs(0),
        cleaner_iterations: 1,
    }
}

fn put_sized(rig: &Rig, key: BlockNum, bytes: &[u8], size: i64) {
    let fullhash = full_hash(rig.cf.filenum(), key);
    let pin = rig
        .cache
        .put(
            &rig.cf,
            key,
            fullhash,
            bytes.to_vec(),
            PairAttr::new(size),
            &rig.callbacks,
            None,
        )
        .expect("put failed");
    pin.unpin(Dirty::Dirty, PairAttr::invalid());
}

fn pin(rig: &Rig, key: BlockNum, may_modify: bool) -> pagecache::PinnedPage<Vec<u8>, ()> {
    let fullhash = full_hash(rig.cf.filenum(), key);
    rig.cache
        .get_and_pin(&rig.cf, key, fullhash, may_modify, &rig.callbacks, &rig.hooks)
        .expect("pin failed")
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !cond() {
        assert!(Instant::now() < end, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

struct RecordingLogger {
    next_lsn: AtomicU64,
    begins: Mutex<Vec<Lsn>>,
    ends: Mutex<Vec<(Lsn, u32, u32)>>,
}

impl RecordingLogger {
    fn new() -> Self {
        RecordingLogger {
            next_lsn: AtomicU64::new(41),
            begins: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
        }
    }
}

impl CheckpointLogger for RecordingLogger {
    fn begin_checkpoint(&self) -> io::Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        self.begins.lock().push(lsn);
        Ok(lsn)
    }

    fn end_checkpoint(
        &self,
        begin_lsn: Lsn,
        num_files: u32,
        num_txns: u32,
        _fsync: bool,
    ) -> io::Result<()> {
        self.ends.lock().push((begin_lsn, num_files, num_txns));
        Ok(())
    }
}

#[test]
fn hit_then_miss_then_flush() {
    let rig = rig(manual_options(128 * 1024 * 1024), None);
    put_sized(&rig, 1, b"A", 10);

    let p = pin(&rig, 1, false);
    assert_eq!(&*p.value(), b"A");
    p.unpin(Dirty::Clean, PairAttr::invalid());

    rig.cache.flush_file(&rig.cf).unwrap();
    assert_eq!(rig.backing.writes(), 1);
    assert_eq!(rig.backing.pages.lock().get(&1).unwrap().as_slice(), b"A");

    // The page left the cache, so the next pin goes back to disk.
    assert_eq!(rig.backing.fetches.load(Ordering::SeqCst), 0);
    let p = pin(&rig, 1, false);
    assert_eq!(&*p.value(), b"A");
    drop(p);
    assert_eq!(rig.backing.fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn size_triggered_eviction() {
    let rig = rig(manual_options(100), None);
    // The high watermark (150) makes late puts sleep until the evictor
    // catches up, so this loop also exercises flow control.
    for key in 0..20u64 {
        put_sized(&rig, key, format!("p{key}").as_bytes(), 10);
    }

    wait_until(Duration::from_secs(10), || {
        rig.cache.stats().size_current <= 150
    });
    wait_until(Duration::from_secs(10), || {
        rig.cache.stats().size_current <= 100
    });
    // Every evicted page was dirty and went through a real write.
    wait_until(Duration::from_secs(10), || {
        let stats = rig.cache.stats();
        stats.evictions > 0 && stats.evictions == rig.backing.writes() as u64
    });
    // What is gone from the cache is recoverable from the backing.
    for key in rig.backing.written_keys() {
        let p = rig.backing.pages.lock().get(&key).cloned().unwrap();
        assert_eq!(p, format!("p{key}").as_bytes());
    }
}

#[test]
fn checkpoint_clone_path() {
    let logger = Arc::new(RecordingLogger::new());
    let mut r = rig(manual_options(1 << 20), Some(logger.clone()));
    let clone_cb: CloneFn<Vec<u8>> =
        Arc::new(|value: &mut Vec<u8>, _for_checkpoint| (value.clone(), PairAttr::invalid()));
    r.callbacks.clone_value = Some(clone_cb);

    put_sized(&r, 1, b"original", 8);
    r.cache.begin_checkpoint().unwrap();

    // A writer is not blocked behind the checkpoint: the pin clones and
    // returns with the live, mutable copy.
    let mut p = pin(&r, 1, true);
    assert_eq!(&*p.value(), b"original");
    p.value_mut().clear();
    p.value_mut().extend_from_slice(b"mutated");
    p.unpin(Dirty::Dirty, PairAttr::invalid());

    r.cache.end_checkpoint().unwrap();

    // The checkpoint wrote the pre-mutation bytes.
    assert_eq!(
        r.backing.pages.lock().get(&1).unwrap().as_slice(),
        b"original"
    );
    let write_log = r.backing.write_log.lock();
    assert_eq!(write_log.as_slice(), &[(1, true)]);
    drop(write_log);

    // The end record carries the LSN chosen at begin.
    let begins = logger.begins.lock();
    let ends = logger.ends.lock();
    assert_eq!(begins.len(), 1);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].0, begins[0]);
    assert_eq!(ends[0].1, 1); // one file
}

#[test]
fn close_waits_for_clone_serialization() {
    let mut r = rig(manual_options(1 << 20), None);
    let clone_cb: CloneFn<Vec<u8>> =
        Arc::new(|value: &mut Vec<u8>, _for_checkpoint| (value.clone(), PairAttr::invalid()));
    r.callbacks.clone_value = Some(clone_cb);
    // Slow the snapshot write down so the close overlaps it.
    let b = r.backing.clone();
    r.callbacks.flush = Arc::new(move |ctx| {
        if ctx.is_clone {
            thread::sleep(Duration::from_millis(100));
        }
        if ctx.do_write {
            b.write_log.lock().push((ctx.key, ctx.for_checkpoint));
            b.pages.lock().insert(ctx.key, ctx.value.clone());
        }
        Ok(None)
    });

    put_sized(&r, 1, b"snapshot", 8);
    r.cache.begin_checkpoint().unwrap();

    // The writer's pin clones the page and leaves the serialization
    // running on the checkpoint pool, holding the page's disk phase.
    let p = pin(&r, 1, true);
    p.unpin(Dirty::Clean, PairAttr::invalid());

    // The clone job is not counted against the file's job manager, so
    // close must wait on the page itself instead of aborting mid-write.
    r.cache.close_file(&r.cf).unwrap();

    assert_eq!(
        r.backing.pages.lock().get(&1).unwrap().as_slice(),
        b"snapshot"
    );
    assert_eq!(r.backing.write_log.lock().as_slice(), &[(1, true)]);

    r.cache.end_checkpoint().unwrap();
}

#[test]
fn dependent_pair_atomicity() {
    let r = rig(manual_options(1 << 20), None);
    let fullhash = |key| full_hash(r.cf.filenum(), key);

    // Three pages pinned for modification.
    let mut pins = Vec::new();
    for key in 1..=3u64 {
        let p = r
            .cache
            .put(
                &r.cf,
                key,
                fullhash(key),
                format!("dep{key}").into_bytes(),
                PairAttr::new(10),
                &r.callbacks,
                None,
            )
            .unwrap();
        pins.push(p);
    }

    r.cache.begin_checkpoint().unwrap();

    // Committing a fourth page that depends on the three: all pending
    // bits are cleared and the writes happen before the call returns.
    let deps: Vec<DependentPin<'_, Vec<u8>, ()>> = pins
        .iter()
        .map(|p| DependentPin {
            pin: p,
            dirty: Dirty::Dirty,
        })
        .collect();
    let new_pin = r
        .cache
        .get_and_pin_with_dependents(&r.cf, 4, fullhash(4), true, &r.callbacks, &r.hooks, &deps)
        .unwrap();

    let mut written = r.backing.written_keys();
    written.sort_unstable();
    assert_eq!(written, vec![1, 2, 3]);
    assert!(r
        .backing
        .write_log
        .lock()
        .iter()
        .all(|(_, for_checkpoint)| *for_checkpoint));

    drop(new_pin);
    for p in pins {
        p.unpin(Dirty::Dirty, PairAttr::invalid());
    }

    // Nothing is left for the end phase; in particular the new page was
    // inserted with its pending bit clear.
    r.cache.end_checkpoint().unwrap();
    let mut written = r.backing.written_keys();
    written.sort_unstable();
    assert_eq!(written, vec![1, 2, 3]);
}

#[test]
fn cleaner_picks_highest_pressure_and_skips_zero() {
    let r = rig(manual_options(1 << 20), None);
    let cleaned: Arc<Mutex<Vec<BlockNum>>> = Arc::new(Mutex::new(Vec::new()));
    let log = cleaned.clone();
    let cleaner_cb: CleanerFn<Vec<u8>, ()> = Arc::new(move |pin| {
        log.lock().push(pin.key());
        pin.unpin(Dirty::Clean, PairAttr::invalid());
        Ok(())
    });
    let mut callbacks = r.callbacks.clone();
    callbacks.cleaner = Some(cleaner_cb);

    for (key, pressure) in [(1u64, 0i64), (2, 5), (3, 9)] {
        let mut attr = PairAttr::new(10);
        attr.cache_pressure_size = pressure;
        let pin = r
            .cache
            .put(
                &r.cf,
                key,
                full_hash(r.cf.filenum(), key),
                vec![0u8; 10],
                attr,
                &callbacks,
                None,
            )
            .unwrap();
        pin.unpin(Dirty::Dirty, PairAttr::invalid());
    }

    // One iteration visiting all three pairs selects only the score-9 one.
    let cleaned_count = r.cache.run_cleaner();
    assert_eq!(cleaned_count, 1);
    assert_eq!(cleaned.lock().as_slice(), &[3]);
}

#[test]
fn cleaner_never_selects_zero_pressure() {
    let r = rig(manual_options(1 << 20), None);
    let invoked = Arc::new(AtomicUsize::new(0));
    let hits = invoked.clone();
    let cleaner_cb: CleanerFn<Vec<u8>, ()> = Arc::new(move |pin| {
        hits.fetch_add(1, Ordering::SeqCst);
        drop(pin);
        Ok(())
    });
    let mut callbacks = r.callbacks.clone();
    callbacks.cleaner = Some(cleaner_cb);

    // The only candidate scores zero; it must never be picked.
    let mut attr = PairAttr::new(10);
    attr.cache_pressure_size = 0;
    let pin = r
        .cache
        .put(
            &r.cf,
            7,
            full_hash(r.cf.filenum(), 7),
            vec![0u8; 10],
            attr,
            &callbacks,
            None,
        )
        .unwrap();
    pin.unpin(Dirty::Dirty, PairAttr::invalid());

    assert_eq!(r.cache.run_cleaner(), 0);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn evicted_page_round_trips_through_fetch() {
    let r = rig(manual_options(1 << 20), None);
    put_sized(&r, 5, b"round-trip-bytes", 60);
    // Write it down so eviction has nothing left to do but drop it.
    r.cache.checkpoint().unwrap();

    r.cache.set_size_limit(16);
    wait_until(Duration::from_secs(10), || r.cache.stats().num_pairs == 0);

    let p = pin(&r, 5, false);
    assert_eq!(&*p.value(), b"round-trip-bytes");
    drop(p);
    assert_eq!(r.backing.fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn graceful_close_under_load() {
    let r = rig(manual_options(1 << 20), None);
    // Seed a few pages so the spinners mostly hit.
    for key in 0..8u64 {
        put_sized(&r, key, b"spin", 10);
    }

    let clients = 100;
    let barrier = Arc::new(Barrier::new(clients + 1));
    let mut handles = Vec::new();
    for i in 0..clients {
        let cache = r.cache.clone();
        let cf = r.cf.clone();
        let callbacks = r.callbacks.clone();
        let hooks = r.hooks.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            let key = (i % 8) as u64;
            let fullhash = full_hash(cf.filenum(), key);
            loop {
                match cache.get_and_pin(&cf, key, fullhash, false, &callbacks, &hooks) {
                    Ok(pin) => drop(pin),
                    Err(CacheError::FileClosing) => break,
                    Err(e) => panic!("unexpected pin error: {e}"),
                }
            }
        }));
    }

    barrier.wait();
    thread::sleep(Duration::from_millis(50));
    r.cache.close_file(&r.cf).unwrap();

    // Every client observes the closed file and stops.
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(r.cache.stats().num_pairs, 0);
    let fullhash = full_hash(r.cf.filenum(), 0);
    assert!(matches!(
        r.cache
            .get_and_pin(&r.cf, 0, fullhash, false, &r.callbacks, &r.hooks),
        Err(CacheError::FileClosing)
    ));
}

#[test]
fn shutdown_flushes_and_empties() {
    let r = rig(manual_options(1 << 20), None);
    for key in 0..4u64 {
        put_sized(&r, key, format!("s{key}").as_bytes(), 10);
    }
    r.cache.shutdown();
    assert_eq!(r.backing.writes(), 4);
    for key in 0..4u64 {
        assert_eq!(
            r.backing.pages.lock().get(&key).unwrap(),
            format!("s{key}").as_bytes()
        );
    }
}
