//! Implements backup of a domain's web root using [Site].

use std::path::{Path, PathBuf};

use super::{Outcome, Unit, UnitError};
use crate::util::archive::{self, Compression};

const HTDOCS_ARCHIVE: &str = "htdocs.tar.gz";
const FILES_ARCHIVE: &str = "files.tar.gz";

/// The [Site] unit archives the web root `<www_root>/<domain>`.
///
/// If the domain has a `htdocs` directory only that one is archived as
/// `domains/<domain>/htdocs.tar.gz`, otherwise the whole directory as
/// `domains/<domain>/files.tar.gz`.
#[derive(Debug, Clone)]
pub struct Site {
    domain: String,
    domain_root: PathBuf,
}

impl Site {
    pub fn new(www_root: &Path, domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            domain_root: www_root.join(domain),
        }
    }

    fn staged_dir(&self, staging: &Path) -> PathBuf {
        staging.join("domains").join(&self.domain)
    }
}

impl Unit for Site {
    type Error = UnitError;

    fn label(&self) -> String {
        format!("domain {}", self.domain)
    }

    fn collect(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        if !self.domain_root.is_dir() {
            return Err(UnitError::Missing(self.domain_root.clone()));
        }

        let htdocs = self.domain_root.join("htdocs");
        let (source, name) = if htdocs.is_dir() {
            (htdocs, HTDOCS_ARCHIVE)
        } else {
            (self.domain_root.clone(), FILES_ARCHIVE)
        };

        let staged_dir = self.staged_dir(staging);
        std::fs::create_dir_all(&staged_dir).map_err(UnitError::io(&staged_dir))?;
        log::info!(target: "backend::site", "Archive web root of {}: {}", self.domain, source.display());
        let size = archive::create_archive(&source, &staged_dir.join(name), Compression::Gzip)?;
        log::debug!(target: "backend::site", "Archived {size} bytes of {}", self.domain);

        Ok(Outcome::Done)
    }

    fn restore(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let staged_dir = self.staged_dir(staging);
        let (archive_file, dest) = if staged_dir.join(HTDOCS_ARCHIVE).is_file() {
            (staged_dir.join(HTDOCS_ARCHIVE), self.domain_root.join("htdocs"))
        } else if staged_dir.join(FILES_ARCHIVE).is_file() {
            (staged_dir.join(FILES_ARCHIVE), self.domain_root.clone())
        } else {
            return Err(UnitError::Missing(staged_dir));
        };

        log::info!(target: "backend::site", "Restore web root of {} to {}", self.domain, dest.display());
        archive::extract_archive(&archive_file, &dest, Compression::Gzip)?;

        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn archives_whole_domain_without_htdocs() {
        let www = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::create_dir(www.path().join("example.com")).unwrap();
        fs::write(www.path().join("example.com/index.html"), "hello world").unwrap();

        let site = Site::new(www.path(), "example.com");
        assert_eq!(site.collect(staging.path()).unwrap(), Outcome::Done);

        assert!(staging.path().join("domains/example.com/files.tar.gz").is_file());
        assert!(!staging.path().join("domains/example.com/htdocs.tar.gz").exists());
    }

    #[test]
    fn prefers_htdocs() {
        let www = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::create_dir_all(www.path().join("example.com/htdocs")).unwrap();
        fs::write(www.path().join("example.com/htdocs/index.php"), "<?php").unwrap();

        Site::new(www.path(), "example.com")
            .collect(staging.path())
            .unwrap();

        assert!(staging.path().join("domains/example.com/htdocs.tar.gz").is_file());
    }

    #[test]
    fn missing_web_root_is_an_error() {
        let www = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();

        assert!(matches!(
            Site::new(www.path(), "gone.example").collect(staging.path()),
            Err(UnitError::Missing(_))
        ));
    }

    #[test]
    fn restore_overwrites_in_place() {
        let www = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let index = www.path().join("example.com/htdocs/index.html");
        fs::create_dir_all(index.parent().unwrap()).unwrap();
        fs::write(&index, "original").unwrap();

        let site = Site::new(www.path(), "example.com");
        site.collect(staging.path()).unwrap();
        fs::write(&index, "defaced").unwrap();

        site.restore(staging.path()).unwrap();
        site.restore(staging.path()).unwrap();
        assert_eq!(fs::read_to_string(&index).unwrap(), "original");
    }
}
