//! Shared-memory lock backend — an mmap'd array of atomic words.
//!
//! The backing file lives on a tmpfs (`/dev/shm` by default) and is mapped
//! `MAP_SHARED` by every process. Each lock is one `AtomicU32`: bit 0 is the
//! held flag, bit 1 the allocated flag. Acquisition spins with capped
//! backoff, which is acceptable because entity critical sections are short
//! and contention is per-container.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{EntityLock, LockError, LockId, LockManager};

const MAGIC: u32 = 0x4c_4f_43_4b; // "LOCK"
const HEADER_WORDS: usize = 2; // magic, count

const HELD: u32 = 0b01;
const ALLOCATED: u32 = 0b10;

/// Raw mapping over the backing file. Unmapped on drop.
struct ShmRegion {
    ptr: *mut AtomicU32,
    len: usize,
    // Kept open so the mapping always has a live backing descriptor.
    _file: File,
}

// The region is only ever accessed through atomics.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    fn map(file: File, len: usize) -> Result<Self, LockError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                std::os::fd::AsRawFd::as_raw_fd(&file),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(LockError::Io(io::Error::last_os_error()));
        }
        Ok(ShmRegion {
            ptr: ptr as *mut AtomicU32,
            len,
            _file: file,
        })
    }

    fn word(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index * 4 < self.len);
        unsafe { &*self.ptr.add(index) }
    }

    fn slot(&self, id: LockId) -> &AtomicU32 {
        self.word(HEADER_WORDS + id as usize)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

pub struct ShmLockManager {
    region: Arc<ShmRegion>,
    path: PathBuf,
    count: u32,
}

impl ShmLockManager {
    /// Open the pool at `path`, creating and zero-initializing it if absent.
    pub fn create(path: impl AsRef<Path>, count: u32) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = (HEADER_WORDS + count as usize) * 4;
        let existing = file.metadata()?.len();
        if existing == 0 {
            file.set_len(len as u64)?;
            let region = ShmRegion::map(file, len)?;
            for i in 0..count {
                region.slot(i).store(0, Ordering::SeqCst);
            }
            region.word(1).store(count, Ordering::SeqCst);
            region.word(0).store(MAGIC, Ordering::SeqCst);
            tracing::debug!(path = %path.display(), count, "initialized shm lock pool");
            return Ok(ShmLockManager {
                region: Arc::new(region),
                path,
                count,
            });
        }
        Self::validate(file, path, count)
    }

    /// Open an existing pool; the stored lock count must match `count`.
    pub fn open(path: impl AsRef<Path>, count: u32) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::validate(file, path, count)
    }

    /// Discard any existing pool at `path` and create a fresh one. Callers
    /// must hold exclusive engine access (renumber contract).
    pub fn reinit(path: impl AsRef<Path>, count: u32) -> Result<Self, LockError> {
        match std::fs::remove_file(path.as_ref()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::create(path, count)
    }

    fn validate(file: File, path: PathBuf, count: u32) -> Result<Self, LockError> {
        let actual_len = file.metadata()?.len() as usize;
        if actual_len < HEADER_WORDS * 4 {
            return Err(LockError::Corrupt(format!(
                "{} is too short to hold a lock pool header",
                path.display()
            )));
        }
        let region = ShmRegion::map(file, actual_len)?;
        if region.word(0).load(Ordering::SeqCst) != MAGIC {
            return Err(LockError::Corrupt(format!(
                "{} does not contain a lock pool",
                path.display()
            )));
        }
        let stored = region.word(1).load(Ordering::SeqCst);
        if stored != count {
            return Err(LockError::CountMismatch {
                expected: count,
                actual: stored,
            });
        }
        if actual_len < (HEADER_WORDS + stored as usize) * 4 {
            return Err(LockError::Corrupt(format!(
                "{} is truncated: header promises {} locks",
                path.display(),
                stored
            )));
        }
        Ok(ShmLockManager {
            region: Arc::new(region),
            path,
            count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LockManager for ShmLockManager {
    fn allocate(&self) -> Result<LockId, LockError> {
        for id in 0..self.count {
            let won = self
                .region
                .slot(id)
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                    if w & ALLOCATED == 0 {
                        Some(w | ALLOCATED)
                    } else {
                        None
                    }
                })
                .is_ok();
            if won {
                return Ok(id);
            }
        }
        Err(LockError::NoFreeLocks)
    }

    fn allocate_at(&self, id: LockId) -> Result<(), LockError> {
        if id >= self.count {
            return Err(LockError::NoSuchLock(id));
        }
        self.region
            .slot(id)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                if w & ALLOCATED == 0 {
                    Some(w | ALLOCATED)
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|_| LockError::LockTaken(id))
    }

    fn retrieve(&self, id: LockId) -> Result<Box<dyn EntityLock>, LockError> {
        if id >= self.count {
            return Err(LockError::NoSuchLock(id));
        }
        if self.region.slot(id).load(Ordering::SeqCst) & ALLOCATED == 0 {
            return Err(LockError::NoSuchLock(id));
        }
        Ok(Box::new(ShmLock {
            region: Arc::clone(&self.region),
            id,
        }))
    }

    fn free(&self, id: LockId) -> Result<(), LockError> {
        if id >= self.count {
            return Err(LockError::NoSuchLock(id));
        }
        // Clears both flags; freeing an unallocated lock is a no-op so that
        // concurrent removers cannot trip over each other.
        self.region.slot(id).store(0, Ordering::SeqCst);
        Ok(())
    }

    fn available(&self) -> Result<usize, LockError> {
        let mut free = 0;
        for id in 0..self.count {
            if self.region.slot(id).load(Ordering::SeqCst) & ALLOCATED == 0 {
                free += 1;
            }
        }
        Ok(free)
    }

    fn held(&self) -> Result<Vec<LockId>, LockError> {
        let mut held = Vec::new();
        for id in 0..self.count {
            if self.region.slot(id).load(Ordering::SeqCst) & HELD != 0 {
                held.push(id);
            }
        }
        Ok(held)
    }

    fn count(&self) -> u32 {
        self.count
    }
}

struct ShmLock {
    region: Arc<ShmRegion>,
    id: LockId,
}

impl ShmLock {
    fn try_set_held(&self) -> bool {
        self.region
            .slot(self.id)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                if w & HELD == 0 {
                    Some(w | HELD)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

impl EntityLock for ShmLock {
    fn id(&self) -> LockId {
        self.id
    }

    fn lock(&self) {
        let mut backoff = Duration::from_micros(50);
        loop {
            if self.try_set_held() {
                return;
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(10));
        }
    }

    fn try_lock(&self) -> bool {
        self.try_set_held()
    }

    fn unlock(&self) {
        self.region.slot(self.id).fetch_and(!HELD, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reopen_preserves_allocations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.shm");

        let first = ShmLockManager::create(&path, 16).unwrap();
        let id = first.allocate().unwrap();
        drop(first);

        let second = ShmLockManager::open(&path, 16).unwrap();
        assert!(second.retrieve(id).is_ok());
        assert_eq!(second.available().unwrap(), 15);
    }

    #[test]
    fn test_reinit_clears_pool() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.shm");

        let first = ShmLockManager::create(&path, 16).unwrap();
        first.allocate().unwrap();
        drop(first);

        let fresh = ShmLockManager::reinit(&path, 32).unwrap();
        assert_eq!(fresh.available().unwrap(), 32);
    }

    #[test]
    fn test_held_reporting() {
        let dir = TempDir::new().unwrap();
        let mgr = ShmLockManager::create(dir.path().join("pool.shm"), 8).unwrap();
        let id = mgr.allocate().unwrap();
        let lock = mgr.retrieve(id).unwrap();

        assert!(mgr.held().unwrap().is_empty());
        lock.lock();
        assert_eq!(mgr.held().unwrap(), vec![id]);
        lock.unlock();
        assert!(mgr.held().unwrap().is_empty());
    }

    #[test]
    fn test_contention_across_threads() {
        let dir = TempDir::new().unwrap();
        let mgr = Arc::new(ShmLockManager::create(dir.path().join("pool.shm"), 4).unwrap());
        let id = mgr.allocate().unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = Arc::clone(&mgr);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let lock = mgr.retrieve(id).unwrap();
                for _ in 0..50 {
                    lock.lock();
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    // Only one thread inside the critical section at a time.
                    assert_eq!(counter.load(Ordering::SeqCst), seen + 1);
                    counter.fetch_sub(1, Ordering::SeqCst);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
