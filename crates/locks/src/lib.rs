//! Cross-process lock manager — fixed pool of named locks addressable by index.
//!
//! Two backends with an identical contract: a shared-memory array of atomics
//! (`shm`) and a directory of advisory-locked files (`file`). The engine
//! stores a lock index per entity and retrieves a handle at load time; the
//! handle serializes access to that entity across every process sharing the
//! backing storage.

pub mod file;
pub mod shm;

use std::fmt;
use thiserror::Error;

pub use file::FileLockManager;
pub use shm::ShmLockManager;

/// Index of a lock inside a manager's pool.
pub type LockId = u32;

/// Default pool size when the configuration does not specify one.
pub const DEFAULT_LOCK_COUNT: u32 = 2048;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("no free locks available")]
    NoFreeLocks,
    #[error("no such lock: {0}")]
    NoSuchLock(LockId),
    #[error("lock {0} is already allocated")]
    LockTaken(LockId),
    #[error("lock pool holds {actual} locks but {expected} were requested; renumber required")]
    CountMismatch { expected: u32, actual: u32 },
    #[error("operation not supported by this lock backend")]
    NotImplemented,
    #[error("lock storage corrupted: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A handle to one allocated lock. Blocking; safe to share across threads,
/// but a single handle must not be locked twice concurrently.
pub trait EntityLock: Send + Sync {
    fn id(&self) -> LockId;
    /// Block until the lock is acquired.
    fn lock(&self);
    /// Attempt to acquire without blocking.
    fn try_lock(&self) -> bool;
    fn unlock(&self);
}

impl fmt::Debug for dyn EntityLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityLock({})", self.id())
    }
}

/// RAII guard returned by [`lock_guard`]. Unlocks on drop.
pub struct LockGuard<'a> {
    lock: &'a dyn EntityLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Acquire `lock` and return a guard that releases it when dropped.
pub fn lock_guard(lock: &dyn EntityLock) -> LockGuard<'_> {
    lock.lock();
    LockGuard { lock }
}

/// Allocation and retrieval of locks from a fixed pool shared between
/// processes. Implementations must tolerate concurrent callers in other
/// processes for every operation.
pub trait LockManager: Send + Sync {
    /// Claim the first free lock and return its index.
    fn allocate(&self) -> Result<LockId, LockError>;

    /// Claim a specific index. Used by refresh and renumber, which replay
    /// indices recorded in the database into a freshly initialized pool.
    fn allocate_at(&self, id: LockId) -> Result<(), LockError>;

    /// Return a handle for an allocated lock.
    fn retrieve(&self, id: LockId) -> Result<Box<dyn EntityLock>, LockError>;

    /// Return a lock to the pool. Idempotent: freeing a free lock succeeds,
    /// so concurrent removal of the same entity cannot fail here.
    fn free(&self, id: LockId) -> Result<(), LockError>;

    /// Number of locks not currently allocated.
    fn available(&self) -> Result<usize, LockError>;

    /// Indices currently locked (not merely allocated). Backends without
    /// visibility into held state return [`LockError::NotImplemented`].
    fn held(&self) -> Result<Vec<LockId>, LockError>;

    /// Total pool size.
    fn count(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn managers(dir: &TempDir) -> Vec<Box<dyn LockManager>> {
        vec![
            Box::new(ShmLockManager::create(dir.path().join("locks.shm"), 64).unwrap()),
            Box::new(FileLockManager::create(dir.path().join("locks.d"), 64).unwrap()),
        ]
    }

    #[test]
    fn test_allocate_free_cycle() {
        let dir = TempDir::new().unwrap();
        for mgr in managers(&dir) {
            let a = mgr.allocate().unwrap();
            let b = mgr.allocate().unwrap();
            assert_ne!(a, b);
            assert_eq!(mgr.available().unwrap(), 62);

            mgr.free(a).unwrap();
            // Freeing twice must not fail.
            mgr.free(a).unwrap();
            assert_eq!(mgr.available().unwrap(), 63);

            // The freed index is reusable.
            let c = mgr.allocate().unwrap();
            assert_eq!(c, a);
        }
    }

    #[test]
    fn test_allocate_at_conflicts() {
        let dir = TempDir::new().unwrap();
        for mgr in managers(&dir) {
            mgr.allocate_at(7).unwrap();
            assert!(matches!(mgr.allocate_at(7), Err(LockError::LockTaken(7))));
            assert!(matches!(
                mgr.allocate_at(64),
                Err(LockError::NoSuchLock(64))
            ));
        }
    }

    #[test]
    fn test_exhaustion() {
        let dir = TempDir::new().unwrap();
        let mgr = ShmLockManager::create(dir.path().join("small.shm"), 2).unwrap();
        mgr.allocate().unwrap();
        mgr.allocate().unwrap();
        assert!(matches!(mgr.allocate(), Err(LockError::NoFreeLocks)));
    }

    #[test]
    fn test_lock_guard_unlocks() {
        let dir = TempDir::new().unwrap();
        for mgr in managers(&dir) {
            let id = mgr.allocate().unwrap();
            let lock = mgr.retrieve(id).unwrap();
            {
                let _guard = lock_guard(lock.as_ref());
                assert!(!lock.try_lock());
            }
            assert!(lock.try_lock());
            lock.unlock();
        }
    }

    #[test]
    fn test_count_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks.shm");
        ShmLockManager::create(&path, 64).unwrap();
        match ShmLockManager::open(&path, 128) {
            Err(LockError::CountMismatch { expected, actual }) => {
                assert_eq!(expected, 128);
                assert_eq!(actual, 64);
            }
            other => panic!("expected CountMismatch, got {:?}", other.map(|_| ())),
        }
    }
}
