//! Scratch directories below `<root>/staging/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const STAGING_DIR: &str = "staging";

/// A staging directory, removed with all its contents on drop.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Creates the fresh staging directory `<root>/staging/<name>`.
    ///
    /// Leftovers of a previous run with the same name are removed first.
    pub fn create(root: &Path, name: &str) -> io::Result<Self> {
        let path = root.join(STAGING_DIR).join(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        log::trace!(target: "engine::staging", "Created {}", path.display());

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::trace!(target: "engine::staging", "Removed {}", self.path.display()),
            Err(e) => {
                log::warn!(target: "engine::staging", "Removing staging directory {} failed: {e}", self.path.display())
            }
        }
    }
}

/// Removes everything below `<root>/staging/`.
///
/// Must only be called while holding the root lock, anything found there is
/// then left over from a crashed run.
pub fn reap(root: &Path) -> usize {
    let Ok(read_dir) = fs::read_dir(root.join(STAGING_DIR)) else {
        return 0;
    };

    let mut reaped = 0;
    for path in read_dir.filter_map(Result::ok).map(|entry| entry.path()) {
        let removed = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {
                log::info!(target: "engine::staging", "Removed orphaned staging data {}", path.display());
                reaped += 1;
            }
            Err(e) => log::warn!(target: "engine::staging", "Removing orphaned {} failed: {e}", path.display()),
        }
    }
    reaped
}
