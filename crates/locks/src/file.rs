//! File lock backend — one file per lock, advisory `flock`.
//!
//! Fallback for hosts where the shm backend is unavailable (no tmpfs, or
//! locked-down `/dev/shm`). Allocation state is the existence of the file;
//! held state lives in the kernel's flock table and is invisible to us, so
//! [`LockManager::held`] reports `NotImplemented`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;

use crate::{EntityLock, LockError, LockId, LockManager};

pub struct FileLockManager {
    dir: PathBuf,
    count: u32,
}

impl FileLockManager {
    /// Open the lock directory at `dir`, creating it if absent.
    pub fn create(dir: impl AsRef<Path>, count: u32) -> Result<Self, LockError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(FileLockManager { dir, count })
    }

    /// Remove every lock file and start over with a pool of `count`.
    pub fn reinit(dir: impl AsRef<Path>, count: u32) -> Result<Self, LockError> {
        let dir = dir.as_ref().to_path_buf();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::create(dir, count)
    }

    fn lock_path(&self, id: LockId) -> PathBuf {
        self.dir.join(id.to_string())
    }
}

impl LockManager for FileLockManager {
    fn allocate(&self) -> Result<LockId, LockError> {
        for id in 0..self.count {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.lock_path(id))
            {
                Ok(_) => return Ok(id),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(LockError::NoFreeLocks)
    }

    fn allocate_at(&self, id: LockId) -> Result<(), LockError> {
        if id >= self.count {
            return Err(LockError::NoSuchLock(id));
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(id))
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::LockTaken(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn retrieve(&self, id: LockId) -> Result<Box<dyn EntityLock>, LockError> {
        if id >= self.count {
            return Err(LockError::NoSuchLock(id));
        }
        // The tmp dir may have been wiped by a reboot; an allocated lock is
        // recorded in the database, so recreate its file on demand.
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.lock_path(id))?;
        Ok(Box::new(FileLock {
            path: self.lock_path(id),
            id,
            file: Mutex::new(None),
        }))
    }

    fn free(&self, id: LockId) -> Result<(), LockError> {
        if id >= self.count {
            return Err(LockError::NoSuchLock(id));
        }
        match std::fs::remove_file(self.lock_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn available(&self) -> Result<usize, LockError> {
        let mut taken = 0usize;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if matches!(name.parse::<LockId>(), Ok(id) if id < self.count) {
                    taken += 1;
                }
            }
        }
        Ok(self.count as usize - taken.min(self.count as usize))
    }

    fn held(&self) -> Result<Vec<LockId>, LockError> {
        Err(LockError::NotImplemented)
    }

    fn count(&self) -> u32 {
        self.count
    }
}

struct FileLock {
    path: PathBuf,
    id: LockId,
    /// Open descriptor while held. flock is per open-file-description, so
    /// every acquisition opens the file fresh.
    file: Mutex<Option<File>>,
}

impl FileLock {
    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
    }
}

impl EntityLock for FileLock {
    fn id(&self) -> LockId {
        self.id
    }

    fn lock(&self) {
        loop {
            match self.open().and_then(|f| {
                f.lock_exclusive()?;
                Ok(f)
            }) {
                Ok(f) => {
                    *self.file.lock().unwrap() = Some(f);
                    return;
                }
                Err(e) => {
                    // Lock files live on local disk; failure here is either
                    // transient pressure or a wiped directory that open()
                    // will recreate next round.
                    tracing::warn!(lock = self.id, error = %e, "file lock acquisition failed, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }

    fn try_lock(&self) -> bool {
        match self.open().and_then(|f| {
            f.try_lock_exclusive()?;
            Ok(f)
        }) {
            Ok(f) => {
                *self.file.lock().unwrap() = Some(f);
                true
            }
            Err(_) => false,
        }
    }

    fn unlock(&self) {
        if let Some(f) = self.file.lock().unwrap().take() {
            let _ = FileExt::unlock(&f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocation_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks.d");

        let first = FileLockManager::create(&path, 8).unwrap();
        let id = first.allocate().unwrap();
        drop(first);

        let second = FileLockManager::create(&path, 8).unwrap();
        assert_eq!(second.available().unwrap(), 7);
        assert!(matches!(
            second.allocate_at(id),
            Err(LockError::LockTaken(_))
        ));
    }

    #[test]
    fn test_retrieve_recreates_missing_file() {
        let dir = TempDir::new().unwrap();
        let mgr = FileLockManager::create(dir.path().join("locks.d"), 8).unwrap();
        let id = mgr.allocate().unwrap();

        // Simulate a reboot wiping the directory.
        std::fs::remove_file(dir.path().join("locks.d").join(id.to_string())).unwrap();
        let lock = mgr.retrieve(id).unwrap();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_held_not_implemented() {
        let dir = TempDir::new().unwrap();
        let mgr = FileLockManager::create(dir.path().join("locks.d"), 8).unwrap();
        assert!(matches!(mgr.held(), Err(LockError::NotImplemented)));
    }
}
