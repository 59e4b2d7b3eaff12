//! Snapshot of the host state files using [HostMetadata].

use std::fs;
use std::path::{Path, PathBuf};

use super::{Outcome, Unit, UnitError};
use crate::util::atomic;

/// State files of the host, snapshotted into `metadata/` with every backup.
pub const STATE_FILES: [&str; 3] = ["domains.json", "ssl.json", "mail.json"];

const METADATA_DIR: &str = "metadata";

/// The [HostMetadata] unit copies the host's state files.
///
/// Files which don't exist are left out. The `metadata/` directory itself is
/// always created.
#[derive(Debug, Clone)]
pub struct HostMetadata {
    state_dir: PathBuf,
}

impl HostMetadata {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }
}

impl Unit for HostMetadata {
    type Error = UnitError;

    fn label(&self) -> String {
        METADATA_DIR.to_string()
    }

    fn collect(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let staged_dir = staging.join(METADATA_DIR);
        fs::create_dir_all(&staged_dir).map_err(UnitError::io(&staged_dir))?;

        let mut copied = 0;
        for name in STATE_FILES {
            let source = self.state_dir.join(name);
            if !source.is_file() {
                log::debug!(target: "backend::metadata", "Skipping missing {}", source.display());
                continue;
            }
            fs::copy(&source, staged_dir.join(name)).map_err(UnitError::io(&source))?;
            copied += 1;
        }

        log::info!(target: "backend::metadata", "Snapshotted {copied} state files of {}", self.state_dir.display());
        Ok(if copied > 0 {
            Outcome::Done
        } else {
            Outcome::Absent
        })
    }

    fn restore(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let staged_dir = staging.join(METADATA_DIR);

        let mut restored = 0;
        for name in STATE_FILES {
            let staged = staged_dir.join(name);
            if !staged.is_file() {
                continue;
            }
            let contents = fs::read(&staged).map_err(UnitError::io(&staged))?;
            let dest = self.state_dir.join(name);
            fs::create_dir_all(&self.state_dir).map_err(UnitError::io(&self.state_dir))?;
            atomic::write_atomic(&dest, &contents).map_err(UnitError::io(&dest))?;
            restored += 1;
        }

        Ok(if restored > 0 {
            Outcome::Done
        } else {
            Outcome::Absent
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_present_state_files() {
        let state = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::write(state.path().join("domains.json"), r#"["example.com"]"#).unwrap();

        let unit = HostMetadata::new(state.path());
        assert_eq!(unit.collect(staging.path()).unwrap(), Outcome::Done);

        assert!(staging.path().join("metadata/domains.json").is_file());
        assert!(!staging.path().join("metadata/ssl.json").exists());
    }

    #[test]
    fn empty_state_dir_still_creates_metadata_dir() {
        let state = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();

        let unit = HostMetadata::new(&state.path().join("missing"));
        assert_eq!(unit.collect(staging.path()).unwrap(), Outcome::Absent);
        assert!(staging.path().join("metadata").is_dir());
    }

    #[test]
    fn restores_state_files() {
        let state = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::write(state.path().join("mail.json"), "{}").unwrap();

        let unit = HostMetadata::new(state.path());
        unit.collect(staging.path()).unwrap();
        fs::write(state.path().join("mail.json"), "broken").unwrap();

        assert_eq!(unit.restore(staging.path()).unwrap(), Outcome::Done);
        assert_eq!(fs::read_to_string(state.path().join("mail.json")).unwrap(), "{}");
    }
}
