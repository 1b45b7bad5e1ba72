//! Bounded, in-memory buffer pool mediating all access to the pages of a set
//! of open files.
//!
//! Clients never touch the files directly. They ask the [`Cache`] to pin a
//! page by `(file, key)`, read or mutate the in-memory value through the
//! returned [`PinnedPage`], and unpin it. The cache holds the only
//! authoritative copy of each resident page, writes pages back through
//! client-supplied callbacks, and runs three background threads:
//!
//! - the evictor enforces the size limit with a clock scan
//!   ([`evictor`]),
//! - the checkpointer produces crash-consistent on-disk snapshots
//!   ([`checkpointer`]),
//! - the cleaner picks high cache-pressure pages and lets the client
//!   reshape them ([`cleaner`]).
//!
//! Lock ordering, from outermost to innermost: file registry lock, pair
//! table lock, pending-expensive lock, pending-cheap lock, pair short
//! mutex, pair value lock, pair disk lock. No thread holds more than one
//! pair's locks at a time, except the dependent-pin path which takes them
//! in caller-supplied order.

pub mod background_jobs;
pub mod cache;
pub mod checkpointer;
pub mod cleaner;
pub mod evictor;
pub mod files_manager;
pub mod pair;
pub mod pair_list;
pub mod work_queue;

pub use cache::{
    Cache, CacheError, CacheOptions, CacheStats, DependentPin, PinnedPage, Unlocker, ValueRef,
    ValueRefMut,
};
pub use checkpointer::CheckpointLogger;
pub use files_manager::{CacheFile, FileCallbacks, FileNum, FilesManagerError, Lsn};
pub use pair::{
    BlockNum, CacheCallbacks, CleanerFn, CloneFn, Dirty, EvictionCost, FetchFn, FetchHooks,
    FetchedPage, FlushContext, FlushFn, PairAttr, PairToken, PartialEvictEstimate,
    PartialEvictEstimateFn, PartialEvictFn, PartialFetchFn, PartialFetchRequiredFn, PutFn,
    RemoveKeyFn,
};
pub use pair_list::full_hash;
