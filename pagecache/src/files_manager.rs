//! FilesManager module — registry of the open files whose pages the cache
//! holds.
//!
//! Every open file gets a stable numeric id ([`FileNum`]) and keeps its
//! kernel identity (device, inode) so that a second open of the same inode
//! hands back the existing entry instead of a duplicate. Iteration is in
//! `FileNum` order, which gives the checkpointer a stable file ordering.

use crate::background_jobs::JobManager;
use dashmap::DashMap;
use log::info;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Stable numeric identifier of an open file.
pub type FileNum = u32;

/// Log sequence number handed out by the transactional logger.
pub type Lsn = u64;

/// Kernel identity of an open file, captured at open time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId {
    pub device: u64,
    pub inode: u64,
}

/// Per-file lifecycle and checkpoint callbacks.
///
/// All of them are optional; a file opened with `FileCallbacks::default()`
/// simply takes no part in checkpoint bookkeeping beyond having its dirty
/// pages written.
#[derive(Clone, Default)]
pub struct FileCallbacks {
    /// Runs during begin-checkpoint, after the `begin_checkpoint` log record
    /// exists. Writes the file's "still open" records enumerating live
    /// transactions and returns how many it logged.
    pub log_open_file: Option<Arc<dyn Fn(FileNum, Lsn) -> io::Result<u32> + Send + Sync>>,
    /// Runs at the end of begin-checkpoint; captures a consistent snapshot
    /// of the file's translation table.
    pub begin_checkpoint: Option<Arc<dyn Fn(Lsn) -> io::Result<()> + Send + Sync>>,
    /// Runs during end-checkpoint once every pending page of the file is
    /// durable; writes headers and the translation snapshot.
    pub checkpoint: Option<Arc<dyn Fn(&File, FileNum) -> io::Result<()> + Send + Sync>>,
    /// Runs after the `end_checkpoint` log record; frees blocks the
    /// checkpoint made obsolete.
    pub end_checkpoint: Option<Arc<dyn Fn(&File, FileNum) -> io::Result<()> + Send + Sync>>,
    /// Notified when a checkpoint takes and releases its reference on the
    /// file.
    pub note_pin_by_checkpoint: Option<Arc<dyn Fn(FileNum) + Send + Sync>>,
    pub note_unpin_by_checkpoint: Option<Arc<dyn Fn(FileNum) + Send + Sync>>,
    /// Runs during close, after the file's pages have left the cache and
    /// before the descriptor is dropped.
    pub close: Option<Arc<dyn Fn(&File, FileNum) -> io::Result<()> + Send + Sync>>,
}

/// One open file: descriptor, identity, job counter, and checkpoint state.
pub struct CacheFile {
    filenum: FileNum,
    fileid: FileId,
    path: PathBuf,
    fd: File,
    pub(crate) jobs: JobManager,
    pub(crate) callbacks: FileCallbacks,
    pub(crate) for_checkpoint: AtomicBool,
    pub(crate) closing: AtomicBool,
}

impl CacheFile {
    pub fn filenum(&self) -> FileNum {
        self.filenum
    }

    pub fn fileid(&self) -> FileId {
        self.fileid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The descriptor handed to fetch/flush callbacks.
    pub fn fd(&self) -> &File {
        &self.fd
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn is_for_checkpoint(&self) -> bool {
        self.for_checkpoint.load(Ordering::Acquire)
    }
}

/// Error for [`FilesManager`] related operations.
#[derive(Debug, Error)]
pub enum FilesManagerError {
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
    #[error("no open file with filenum {0}")]
    UnknownFile(FileNum),
}

/// Registry of the open [`CacheFile`]s, keyed by [`FileNum`].
pub struct FilesManager {
    /// BTreeMap so that snapshots iterate in `FileNum` order.
    open: RwLock<BTreeMap<FileNum, Arc<CacheFile>>>,
    /// Kernel identity to filenum, for dedupe of double opens.
    by_id: DashMap<FileId, FileNum>,
    next_filenum: parking_lot::Mutex<FileNum>,
}

impl FilesManager {
    pub fn new() -> Self {
        FilesManager {
            open: RwLock::new(BTreeMap::new()),
            by_id: DashMap::new(),
            next_filenum: parking_lot::Mutex::new(1),
        }
    }

    /// Opens (or creates) the file at `path` and registers it.
    ///
    /// If the same inode is already open, the existing entry is returned and
    /// `callbacks` is ignored.
    pub fn open_file(
        &self,
        path: impl AsRef<Path>,
        callbacks: FileCallbacks,
    ) -> Result<Arc<CacheFile>, FilesManagerError> {
        let path = path.as_ref();
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let meta = fd.metadata()?;
        let fileid = FileId {
            device: meta.dev(),
            inode: meta.ino(),
        };

        if let Some(existing) = self.by_id.get(&fileid) {
            let filenum = *existing;
            drop(existing);
            if let Some(cf) = self.open.read().get(&filenum) {
                return Ok(cf.clone());
            }
        }

        let filenum = {
            let mut next = self.next_filenum.lock();
            let n = *next;
            *next += 1;
            n
        };
        let cf = Arc::new(CacheFile {
            filenum,
            fileid,
            path: path.to_path_buf(),
            fd,
            jobs: JobManager::new(),
            callbacks,
            for_checkpoint: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        self.open.write().insert(filenum, cf.clone());
        self.by_id.insert(fileid, filenum);
        info!("Opened file {} as filenum {}", path.display(), filenum);
        Ok(cf)
    }

    pub fn get(&self, filenum: FileNum) -> Result<Arc<CacheFile>, FilesManagerError> {
        self.open
            .read()
            .get(&filenum)
            .cloned()
            .ok_or(FilesManagerError::UnknownFile(filenum))
    }

    /// Snapshot of every open file, in `FileNum` order.
    pub fn snapshot(&self) -> Vec<Arc<CacheFile>> {
        self.open.read().values().cloned().collect()
    }

    /// Drops the registry entry. The descriptor closes once the last
    /// reference to the [`CacheFile`] goes away.
    pub(crate) fn remove(&self, filenum: FileNum) {
        let removed = self.open.write().remove(&filenum);
        if let Some(cf) = removed {
            self.by_id.remove(&cf.fileid);
            info!("Closed filenum {}", filenum);
        }
    }

    pub fn num_open_files(&self) -> usize {
        self.open.read().len()
    }
}

impl Default for FilesManager {
    fn default() -> Self {
        Self::new()
    }
}
