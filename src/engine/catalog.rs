//! File backed index of [Backup] records.
//!
//! Every backup consists of an archive `archives/<id>.<ext>` and a record
//! `metadata/<id>.json`. Records are only written after their archive is
//! complete, so a record never points to a partial archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};

use super::record::Backup;
use crate::util::archive::Compression;
use crate::util::atomic::{self, TMP_SUFFIX};
use crate::util::checksum;

const ARCHIVES_DIR: &str = "archives";
const METADATA_DIR: &str = "metadata";

#[derive(Debug, Display, Error)]
/// Errors on accessing the [Catalog].
pub enum CatalogError {
    #[display("Backup {id} not found")]
    NotFound { id: String },
    #[display("Accessing {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[display("Record {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl CatalogError {
    fn io(path: &Path) -> impl Fn(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Filter applied by [Catalog::list].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only backups including this domain.
    pub domain: Option<String>,
    /// Only backups taken at or after this point in time.
    pub since: Option<DateTime<Utc>>,
}

impl ListFilter {
    fn matches(&self, backup: &Backup) -> bool {
        let domain = self
            .domain
            .as_deref()
            .is_none_or(|domain| backup.includes_domain(domain));
        let since = self.since.is_none_or(|since| backup.timestamp >= since);
        domain && since
    }
}

/// The catalog of a backup root.
#[derive(Debug, Clone)]
pub struct Catalog {
    archives: PathBuf,
    metadata: PathBuf,
}

impl Catalog {
    /// Opens the catalog of `root`, creating its directories.
    pub fn open(root: &Path) -> Result<Self, CatalogError> {
        let archives = root.join(ARCHIVES_DIR);
        let metadata = root.join(METADATA_DIR);
        for dir in [&archives, &metadata] {
            fs::create_dir_all(dir).map_err(CatalogError::io(dir))?;
        }

        Ok(Self { archives, metadata })
    }

    pub fn archive_path(&self, id: &str, compression: Compression) -> PathBuf {
        self.archives.join(format!("{id}.{}", compression.extension()))
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.metadata.join(format!("{id}.json"))
    }

    /// Finds the archive of `id` regardless of its compression.
    pub fn locate_archive(&self, id: &str) -> Option<(PathBuf, Compression)> {
        Compression::ALL
            .into_iter()
            .map(|compression| (self.archive_path(id, compression), compression))
            .find(|(path, _)| path.is_file())
    }

    /// Whether an archive or a record with `id` exists.
    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).exists() || self.locate_archive(id).is_some()
    }

    /// Writes the record of a completed archive.
    pub fn append(&self, backup: &Backup) -> Result<(), CatalogError> {
        let path = self.record_path(&backup.id);
        atomic::write_json_atomic(&path, backup).map_err(CatalogError::io(&path))?;
        log::debug!(target: "engine::catalog", "Recorded backup {} at {}", backup.id, path.display());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Backup, CatalogError> {
        if !valid_id(id) {
            return Err(CatalogError::NotFound { id: id.to_string() });
        }

        let path = self.record_path(id);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound { id: id.to_string() })
            }
            Err(source) => return Err(CatalogError::Io { path, source }),
        };
        serde_json::from_slice(&contents).map_err(|source| CatalogError::Malformed { path, source })
    }

    /// Records matching `filter`, oldest first.
    ///
    /// Records that can't be read are skipped with a warning.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Backup>, CatalogError> {
        let read_dir = fs::read_dir(&self.metadata).map_err(CatalogError::io(&self.metadata))?;

        let mut backups = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(CatalogError::io(&self.metadata))?;
            let path = dir_entry.path();
            let Some(id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };

            match self.get(id) {
                Ok(backup) if filter.matches(&backup) => backups.push(backup),
                Ok(_) => {}
                Err(e) => log::warn!(target: "engine::catalog", "Skipping unreadable record: {e}"),
            }
        }

        backups.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(backups)
    }

    /// Removes the record and the archive of `id`.
    ///
    /// A missing half is tolerated, [CatalogError::NotFound] is returned only
    /// if neither exists.
    pub fn delete(&self, id: &str) -> Result<(), CatalogError> {
        if !valid_id(id) {
            return Err(CatalogError::NotFound { id: id.to_string() });
        }

        let archive = match self.get(id) {
            Ok(backup) => Some(self.archive_path(id, backup.compression)).filter(|path| path.is_file()),
            Err(CatalogError::NotFound { .. }) => None,
            Err(e) => {
                log::warn!(target: "engine::catalog", "{e}");
                None
            }
        }
        .or_else(|| self.locate_archive(id).map(|(path, _)| path));

        let mut removed = false;
        if let Some(archive) = archive {
            remove(&archive)?;
            removed = true;
        }
        let record = self.record_path(id);
        if record.exists() {
            remove(&record)?;
            removed = true;
        }

        if !removed {
            return Err(CatalogError::NotFound { id: id.to_string() });
        }
        log::info!(target: "engine::catalog", "Deleted backup {id}");
        Ok(())
    }

    /// Recomputes the checksum of the archive of `id` and compares it to the
    /// recorded one. A missing archive fails verification.
    pub fn verify(&self, id: &str) -> Result<bool, CatalogError> {
        let backup = self.get(id)?;
        let path = self.archive_path(id, backup.compression);
        let actual = match checksum::sha256_file(&path) {
            Ok(actual) => actual,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!(target: "engine::catalog", "Archive of backup {id} is missing: {}", path.display());
                return Ok(false);
            }
            Err(source) => return Err(CatalogError::Io { path, source }),
        };

        let matches = actual.eq_ignore_ascii_case(&backup.checksum);
        if !matches {
            log::warn!(target: "engine::catalog", "Checksum mismatch of backup {id}: expected {}, got {actual}", backup.checksum);
        }
        Ok(matches)
    }

    /// Removes record files left behind by an interrupted atomic write.
    pub fn reap_temporaries(&self) -> usize {
        let Ok(read_dir) = fs::read_dir(&self.metadata) else {
            return 0;
        };

        let mut reaped = 0;
        for path in read_dir.filter_map(Result::ok).map(|entry| entry.path()) {
            let is_tmp = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(TMP_SUFFIX));
            if !is_tmp {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => reaped += 1,
                Err(e) => log::warn!(target: "engine::catalog", "Removing {} failed: {e}", path.display()),
            }
        }
        reaped
    }
}

/// Ids are plain file names.
fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\'])
}

fn remove(path: &Path) -> Result<(), CatalogError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(CatalogError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;

    use super::*;
    use crate::engine::record::BackupType;

    fn backup(id: &str, timestamp: DateTime<Utc>, domains: &[&str]) -> Backup {
        Backup {
            id: id.to_string(),
            timestamp,
            backup_type: BackupType::Full,
            scope: String::new(),
            size_bytes: 0,
            compressed_size: 0,
            compression: Compression::Gzip,
            checksum: String::new(),
            verified: true,
            domains_included: domains.iter().map(|d| d.to_string()).collect(),
            databases_included: BTreeMap::new(),
        }
    }

    /// Appends a record together with an archive holding `content`.
    fn store(catalog: &Catalog, mut backup: Backup, content: &[u8]) -> Backup {
        let archive = catalog.archive_path(&backup.id, backup.compression);
        fs::write(&archive, content).unwrap();
        backup.checksum = checksum::sha256_file(&archive).unwrap();
        catalog.append(&backup).unwrap();
        backup
    }

    #[test]
    fn lists_in_timestamp_order_with_filters() {
        let root = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(root.path()).unwrap();
        let now = Utc::now();

        store(&catalog, backup("b", now - Duration::days(1), &["example.com"]), b"b");
        store(&catalog, backup("a", now - Duration::days(10), &[]), b"a");
        store(&catalog, backup("c", now - Duration::days(1), &[]), b"c");

        let ids = |backups: Vec<Backup>| backups.into_iter().map(|b| b.id).collect::<Vec<_>>();
        assert_eq!(ids(catalog.list(&ListFilter::default()).unwrap()), ["a", "b", "c"]);

        let since = ListFilter {
            since: Some(now - Duration::days(7)),
            ..Default::default()
        };
        assert_eq!(ids(catalog.list(&since).unwrap()), ["b", "c"]);

        let domain = ListFilter {
            domain: Some("example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(catalog.list(&domain).unwrap()), ["b"]);
    }

    #[test]
    fn skips_malformed_records() {
        let root = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(root.path()).unwrap();
        store(&catalog, backup("good", Utc::now(), &[]), b"good");
        fs::write(catalog.record_path("bad"), "{").unwrap();

        let backups = catalog.list(&ListFilter::default()).unwrap();
        assert_eq!(backups.len(), 1);
        assert!(matches!(catalog.get("bad"), Err(CatalogError::Malformed { .. })));
    }

    #[test]
    fn verify_detects_flipped_byte() {
        let root = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(root.path()).unwrap();
        let backup = store(&catalog, backup("x", Utc::now(), &[]), b"archive content");
        assert!(catalog.verify("x").unwrap());

        let archive = catalog.archive_path("x", backup.compression);
        let mut bytes = fs::read(&archive).unwrap();
        bytes[0] ^= 0x01;
        fs::write(&archive, bytes).unwrap();
        assert!(!catalog.verify("x").unwrap());

        fs::remove_file(&archive).unwrap();
        assert!(!catalog.verify("x").unwrap());
        assert_eq!(catalog.get("x").unwrap(), backup);
    }

    #[test]
    fn delete_tolerates_missing_half() {
        let root = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(root.path()).unwrap();

        let with_record = store(&catalog, backup("r", Utc::now(), &[]), b"r");
        fs::remove_file(catalog.archive_path("r", with_record.compression)).unwrap();
        catalog.delete("r").unwrap();
        assert!(!catalog.exists("r"));

        fs::write(catalog.archive_path("orphan", Compression::Xz), b"o").unwrap();
        catalog.delete("orphan").unwrap();
        assert!(!catalog.exists("orphan"));

        assert!(matches!(catalog.delete("r"), Err(CatalogError::NotFound { .. })));
        assert!(matches!(catalog.get("../r"), Err(CatalogError::NotFound { .. })));
    }

    #[test]
    fn reaps_interrupted_writes() {
        let root = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(root.path()).unwrap();
        store(&catalog, backup("kept", Utc::now(), &[]), b"k");
        fs::write(root.path().join("metadata/crashed.json.tmp"), "{").unwrap();

        assert_eq!(catalog.reap_temporaries(), 1);
        assert!(catalog.exists("kept"));
        assert!(!root.path().join("metadata/crashed.json.tmp").exists());
    }
}
