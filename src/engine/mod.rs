//! The backup engine: creation, restore, catalog maintenance and transfer of
//! backups below a single backup root.
//!
//! All mutating operations hold the [RootLock] of the backup root for their
//! whole duration. Leftovers of crashed runs are removed right after the lock
//! is acquired.

pub mod catalog;
mod create;
pub mod record;
mod restore;
pub mod schedule;
pub mod scope;
pub mod staging;
mod transfer;

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

pub use catalog::{Catalog, CatalogError, ListFilter};
pub use create::{CollectionWarning, CreateReport, CreateRequest};
pub use record::{Backup, BackupType};
pub use restore::{RestoreFailure, RestoreReport};
pub use scope::ScopeError;

use crate::backends::{DatabaseDumper, DumpError, UnitError};
use crate::config::EngineConfig;
use crate::host::Host;
use crate::util::archive::{ArchiveReadError, ArchiveWriteError};
use crate::util::lock::{LockError, RootLock};
use crate::util::process::ProcessRunner;
use crate::util::retention::Retention;

#[derive(Debug, Display, Error, From)]
/// Errors of the engine's operations.
pub enum EngineError {
    #[from]
    Scope(ScopeError),
    #[from]
    Catalog(CatalogError),
    #[from]
    Archive(ArchiveWriteError),
    #[from]
    Extract(ArchiveReadError),
    #[from]
    Dump(DumpError),
    #[from]
    Unit(UnitError),
    #[from]
    Lock(LockError),
    /// The archive doesn't match its recorded checksum.
    #[display("Checksum of backup {id} does not match, the archive is corrupt")]
    ChecksumMismatch { id: String },
    #[display("Sidecar {} is malformed: {source}", path.display())]
    Sidecar {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[display("Accessing {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl EngineError {
    fn io(path: &Path) -> impl Fn(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Backup engine operating on the backup root of an [EngineConfig].
pub struct Engine<H, R> {
    config: EngineConfig,
    catalog: Catalog,
    host: H,
    dumper: DatabaseDumper<R>,
}

impl<H: Host, R: ProcessRunner> Engine<H, R> {
    /// Opens the backup root, creating its directories.
    pub fn open(config: EngineConfig, host: H, runner: R) -> Result<Self, EngineError> {
        let root = &config.backup_root;
        if root.is_relative() {
            log::warn!(target: "engine", "backup_root is relative: {}", root.display());
        }
        let catalog = Catalog::open(root)?;
        let dumper = DatabaseDumper::new(runner, config.database.clone());

        Ok(Self {
            config,
            catalog,
            host,
            dumper,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Acquires the root lock and removes what crashed runs left behind.
    fn lock(&self) -> Result<RootLock, EngineError> {
        let lock = RootLock::acquire(&self.config.backup_root)?;

        let staged = staging::reap(&self.config.backup_root);
        let temporaries = self.catalog.reap_temporaries();
        if staged + temporaries > 0 {
            log::info!(
                target: "engine",
                "Cleaned up {staged} staging directories and {temporaries} temporary records of interrupted runs"
            );
        }
        Ok(lock)
    }

    /// Id of a backup created at `now`: `YYYYMMDD-HHMMSS`, suffixed with
    /// `-1`, `-2`, ... if taken.
    ///
    /// Must be called while holding the root lock.
    fn allocate_id(&self, now: DateTime<Utc>) -> String {
        let base = now.format("%Y%m%d-%H%M%S").to_string();
        if !self.catalog.exists(&base) {
            return base;
        }

        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|id| !self.catalog.exists(id))
            .unwrap_or(base)
    }

    /// Records matching `filter`, oldest first.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Backup>, EngineError> {
        Ok(self.catalog.list(filter)?)
    }

    /// Whether the archive of `id` still matches its recorded checksum.
    pub fn verify(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.catalog.verify(id)?)
    }

    /// Deletes the backup `id`.
    pub fn delete(&self, id: &str) -> Result<(), EngineError> {
        let _lock = self.lock()?;
        Ok(self.catalog.delete(id)?)
    }

    /// Deletes every backup older than `retention_days` days, returning the
    /// deleted ids.
    ///
    /// Failing deletions are logged and skipped.
    pub fn sweep(&self, retention_days: u32, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        let _lock = self.lock()?;
        let retention = Retention::new(retention_days, now);
        log::info!(
            target: "engine::retention",
            "Deleting backups older than {} days (before {})",
            retention.days,
            retention.cutoff()
        );

        let mut deleted = Vec::new();
        for backup in self.catalog.list(&ListFilter::default())? {
            if retention.retain(&backup.timestamp) {
                continue;
            }
            match self.catalog.delete(&backup.id) {
                Ok(()) => deleted.push(backup.id),
                Err(e) => log::warn!(target: "engine::retention", "Deleting backup {} failed: {e}", backup.id),
            }
        }

        log::info!(target: "engine::retention", "Deleted {} expired backups", deleted.len());
        Ok(deleted)
    }
}
