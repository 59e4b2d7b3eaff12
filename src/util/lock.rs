//! Advisory lock serializing mutating operations on a backup root.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Display, Error)]
/// Errors on acquiring the [RootLock].
pub enum LockError {
    #[display("Unable to open lock file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[display("Unable to lock {}: {source}", path.display())]
    Lock { path: PathBuf, source: Errno },
}

/// Exclusive `flock(2)` on `<root>/.lock`.
///
/// The lock is held until the value is dropped.
pub struct RootLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl RootLock {
    /// Acquires the lock, waiting for other processes holding it.
    pub fn acquire(root: &Path) -> Result<Self, LockError> {
        let path = root.join(LOCK_FILE);
        let file = open(&path)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((file, errno)) if errno == Errno::EWOULDBLOCK => {
                log::info!(target: "lock", "Backup root {} is busy, waiting for the lock", root.display());
                Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, source)| {
                    LockError::Lock {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            Err((_, source)) => return Err(LockError::Lock { path, source }),
        };
        log::trace!(target: "lock", "Acquired {}", path.display());

        Ok(Self { _lock: lock, path })
    }

    /// Acquires the lock if nobody else holds it.
    pub fn try_acquire(root: &Path) -> Result<Option<Self>, LockError> {
        let path = root.join(LOCK_FILE);
        let file = open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self { _lock: lock, path })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, source)) => Err(LockError::Lock { path, source }),
        }
    }
}

impl std::fmt::Debug for RootLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootLock").field("path", &self.path).finish()
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        log::trace!(target: "lock", "Released {}", self.path.display());
    }
}

fn open(path: &Path) -> Result<File, LockError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let root = tempfile::tempdir().unwrap();

        let held = RootLock::acquire(root.path()).unwrap();
        assert!(RootLock::try_acquire(root.path()).unwrap().is_none());

        drop(held);
        assert!(RootLock::try_acquire(root.path()).unwrap().is_some());
    }

    #[test]
    fn missing_root_cannot_be_locked() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing");
        assert!(matches!(
            RootLock::acquire(&missing),
            Err(LockError::Open { .. })
        ));
    }
}
