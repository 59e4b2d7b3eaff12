//! Backend modules collecting and restoring individual parts of the host.
//!
//! Every part of a backup is a [Unit] staged below a common staging
//! directory, mirroring the archive layout:
//!
//! - [Database]: Logical SQL dump of a single database.
//! - [Site]: Web root of a single domain.
//! - [DomainCertificate]: Certificate and key of a single domain.
//! - [SystemItem]: Web server configuration, SSL bundles and firewall rules.
//! - [HostMetadata]: Snapshot of the host's domain, SSL and mail state.

pub mod database;
pub mod metadata;
pub mod site;
pub mod system;

use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

pub use database::{Database, DatabaseDumper, DatabaseRef, DbEngine, DumpError};
pub use metadata::HostMetadata;
pub use site::Site;
pub use system::{DomainCertificate, SystemItem};

use crate::util::archive::{ArchiveReadError, ArchiveWriteError};

/// Result of collecting or restoring a [Unit].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The unit was collected or restored.
    Done,
    /// There was nothing to collect or restore.
    Absent,
}

/// Generic part of a backup.
pub trait Unit {
    /// Error that may happen on collecting or restoring.
    type Error;

    /// Human readable name used in logs and reports.
    fn label(&self) -> String;

    /// Copies the data managed by the implementation into `staging`.
    fn collect(&self, staging: &Path) -> Result<Outcome, Self::Error>;

    /// Writes the data found in `staging` back to its place on the host.
    ///
    /// Restoring the same staging tree twice leaves the host in the same
    /// state as restoring it once.
    fn restore(&self, staging: &Path) -> Result<Outcome, Self::Error>;
}

#[derive(Debug, Display, Error, From)]
/// Errors of the file based units.
pub enum UnitError {
    /// A source that must exist is missing.
    #[display("{} does not exist", _0.display())]
    Missing(#[error(ignore)] PathBuf),
    #[from]
    Archive(ArchiveWriteError),
    #[from]
    Extract(ArchiveReadError),
    #[display("Copying {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl UnitError {
    fn io(path: &Path) -> impl Fn(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Copies the file `src` to `dest`, creating the parent directories of `dest`.
fn copy_file(src: &Path, dest: &Path) -> Result<(), UnitError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(UnitError::io(parent))?;
    }
    std::fs::copy(src, dest).map_err(UnitError::io(src))?;
    Ok(())
}
