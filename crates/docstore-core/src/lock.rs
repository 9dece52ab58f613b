use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::id::ObjectId;

/// Mutual exclusion keyed by document identity.
///
/// Locks are not re-entrant: a second `lock` of a held identity waits (or
/// fails) even when issued by the same holder.
#[async_trait]
pub trait PessimisticLock: Send + Sync {
    /// Acquire the lock on `id`.
    ///
    /// # Arguments
    /// * `blocking` - wait for the lock; when false a single attempt is made
    /// * `timeout` - upper bound on the wait (`None` waits indefinitely)
    ///
    /// # Returns
    /// * `Err(StorageError::LockTimeout)` - the lock was not obtained
    async fn lock(
        &self,
        id: &ObjectId,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Release the lock on `id`. Releasing an unheld lock is a no-op.
    fn unlock(&self, id: &ObjectId) -> Result<(), StorageError>;
}

/// A held lock, released when dropped.
pub struct LockTicket<'a> {
    lock: &'a dyn PessimisticLock,
    id: ObjectId,
    acquired: bool,
}

impl<'a> LockTicket<'a> {
    pub async fn acquire(
        lock: &'a dyn PessimisticLock,
        id: ObjectId,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<LockTicket<'a>, StorageError> {
        lock.lock(&id, blocking, timeout).await?;
        debug!("Acquired lock on {}", id);
        Ok(Self {
            lock,
            id,
            acquired: true,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Release now, surfacing a release failure to the caller.
    pub fn release(mut self) -> Result<(), StorageError> {
        self.acquired = false;
        self.lock.unlock(&self.id)
    }
}

impl Drop for LockTicket<'_> {
    fn drop(&mut self) {
        if !self.acquired {
            return;
        }
        self.acquired = false;
        match self.lock.unlock(&self.id) {
            Ok(()) => debug!("Released lock on {}", self.id),
            Err(e) => warn!("Failed to release lock on {}: {}", self.id, e),
        }
    }
}

/// Repeatedly call `try_once` until it reports success, with backoff.
///
/// Used by lock implementations that can only attempt acquisition without
/// waiting (e.g. OS file locks).
pub async fn poll_acquire<F>(
    id: &ObjectId,
    blocking: bool,
    timeout: Option<Duration>,
    mut try_once: F,
) -> Result<(), StorageError>
where
    F: FnMut() -> Result<bool, StorageError> + Send,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut delay = Duration::from_millis(5);
    loop {
        if try_once()? {
            return Ok(());
        }
        if !blocking {
            return Err(StorageError::LockTimeout(format!("{} is locked", id)));
        }
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockTimeout(format!(
                    "{} still locked after {:?}",
                    id,
                    timeout.unwrap_or_default()
                )));
            }
            delay = delay.min(deadline - now);
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_millis(200));
    }
}

/// In-process lock manager.
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: Mutex<HashSet<ObjectId>>,
    released: Notify,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, id: &ObjectId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn try_acquire(&self, id: &ObjectId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*id)
    }
}

#[async_trait]
impl PessimisticLock for MemoryLock {
    #[instrument(skip(self), level = "debug")]
    async fn lock(
        &self,
        id: &ObjectId,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<(), StorageError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Register interest before checking so a release in between is not missed.
            let released = self.released.notified();
            if self.try_acquire(id) {
                return Ok(());
            }
            if !blocking {
                return Err(StorageError::LockTimeout(format!("{} is locked", id)));
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        return Err(StorageError::LockTimeout(format!(
                            "{} still locked after {:?}",
                            id,
                            timeout.unwrap_or_default()
                        )));
                    }
                }
                None => released.await,
            }
        }
    }

    fn unlock(&self, id: &ObjectId) -> Result<(), StorageError> {
        let removed = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed {
            self.released.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_non_blocking_fails_when_held() {
        let lock = MemoryLock::new();
        let id = ObjectId::new();
        lock.lock(&id, false, None).await.unwrap();

        let err = lock.lock(&id, false, None).await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout(_)));

        lock.unlock(&id).unwrap();
        lock.lock(&id, false, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_times_out() {
        let lock = MemoryLock::new();
        let id = ObjectId::new();
        lock.lock(&id, true, None).await.unwrap();

        let started = Instant::now();
        let err = lock
            .lock(&id, true, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocking_waits_for_release() {
        let lock = Arc::new(MemoryLock::new());
        let id = ObjectId::new();
        lock.lock(&id, false, None).await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.lock(&id, true, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.unlock(&id).unwrap();

        waiter.await.unwrap().unwrap();
        assert!(lock.is_locked(&id));
    }

    #[tokio::test]
    async fn test_ticket_releases_on_drop() {
        let lock = MemoryLock::new();
        let id = ObjectId::new();
        {
            let ticket = LockTicket::acquire(&lock, id, false, None).await.unwrap();
            assert!(ticket.is_acquired());
            assert!(lock.is_locked(&id));
        }
        assert!(!lock.is_locked(&id));

        let ticket = LockTicket::acquire(&lock, id, false, None).await.unwrap();
        ticket.release().unwrap();
        assert!(!lock.is_locked(&id));
    }

    #[tokio::test]
    async fn test_poll_acquire_gives_up_at_deadline() {
        let id = ObjectId::new();
        let mut attempts = 0;
        let err = poll_acquire(&id, true, Some(Duration::from_millis(30)), || {
            attempts += 1;
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout(_)));
        assert!(attempts > 1);

        poll_acquire(&id, false, None, || Ok(true)).await.unwrap();
    }
}
