use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use docstore_core::{poll_acquire, ObjectId, PessimisticLock, StorageError};
use fs2::FileExt;
use tracing::{debug, instrument};

/// Pessimistic lock backed by OS-level exclusive file locks.
///
/// - One lock file per document: `{lock_dir}/{id}.lock`
/// - The open handle is kept while the lock is held; dropping it releases
/// - A crashed process releases its locks (the OS closes its descriptors)
///
/// Locks exclude other processes and other `FileLock` instances as well as
/// concurrent callers of this one.
#[derive(Debug)]
pub struct FileLock {
    lock_dir: PathBuf,
    /// Held locks: id -> open, locked handle
    handles: Mutex<HashMap<ObjectId, File>>,
}

impl FileLock {
    pub fn new(lock_dir: impl AsRef<Path>) -> Self {
        Self {
            lock_dir: lock_dir.as_ref().to_path_buf(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Get the path to a lock file.
    fn lock_path(&self, id: &ObjectId) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", id))
    }

    fn ensure_lock_dir(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.lock_dir).map_err(|e| {
            StorageError::Io(format!(
                "Failed to create lock dir {}: {}",
                self.lock_dir.display(),
                e
            ))
        })
    }

    /// One non-blocking attempt. Returns false when the lock is held elsewhere.
    fn try_lock(&self, id: &ObjectId) -> Result<bool, StorageError> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.contains_key(id) {
            debug!("Lock on {} already held by this process", id);
            return Ok(false);
        }

        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                StorageError::Io(format!("Failed to open lock file {}: {}", path.display(), e))
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                handles.insert(*id, file);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Lock on {} held by another process", id);
                Ok(false)
            }
            Err(e) => Err(StorageError::Io(format!("Failed to acquire lock: {}", e))),
        }
    }
}

#[async_trait]
impl PessimisticLock for FileLock {
    #[instrument(skip(self), level = "debug")]
    async fn lock(
        &self,
        id: &ObjectId,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.ensure_lock_dir()?;
        poll_acquire(id, blocking, timeout, || self.try_lock(id)).await?;
        debug!("Acquired file lock on {}", id);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn unlock(&self, id: &ObjectId) -> Result<(), StorageError> {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(file) => {
                FileExt::unlock(&file)
                    .map_err(|e| StorageError::Io(format!("Failed to release lock on {}: {}", id, e)))?;
                debug!("Released file lock on {}", id);
            }
            None => debug!("Lock on {} not held; nothing to release", id),
        }
        Ok(())
    }
}
