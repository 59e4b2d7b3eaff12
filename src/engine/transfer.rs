//! Moving backups between hosts.
//!
//! An exported backup is its archive plus a sidecar `<archive>.json` holding
//! the record. Importing accepts archives with or without sidecar.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;

use super::record::{Backup, BackupType};
use super::scope::{valid_database, valid_domain};
use super::{Engine, EngineError};
use crate::backends::DbEngine;
use crate::host::Host;
use crate::util::archive::{self, Compression, Entry, EntryKind};
use crate::util::atomic;
use crate::util::checksum;
use crate::util::process::ProcessRunner;

fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(".json");
    PathBuf::from(name)
}

/// What an archive contains, derived from its entries.
#[derive(Debug, Default, PartialEq, Eq)]
struct Inventory {
    domains: BTreeSet<String>,
    databases: BTreeMap<DbEngine, Vec<String>>,
    /// Whether system configuration is contained.
    system: bool,
    size_bytes: u64,
}

impl Inventory {
    fn of(entries: &[Entry]) -> Self {
        let mut inventory = Self::default();
        for entry in entries {
            if entry.kind == EntryKind::File {
                inventory.size_bytes += entry.size;
            }

            let parts: Vec<&str> = entry
                .path
                .components()
                .filter_map(|component| match component {
                    Component::Normal(part) => part.to_str(),
                    _ => None,
                })
                .collect();
            match parts.as_slice() {
                ["domains", domain, _] => {
                    if !valid_domain(domain) {
                        log::warn!(target: "engine::transfer", "Ignoring domain with invalid name {domain:?}");
                        continue;
                    }
                    inventory.domains.insert(domain.to_string());
                }
                ["databases", engine, file] if entry.kind == EntryKind::File => {
                    let (Ok(engine), Some(name)) = (engine.parse::<DbEngine>(), file.strip_suffix(".sql")) else {
                        continue;
                    };
                    if !valid_database(name) {
                        log::warn!(target: "engine::transfer", "Ignoring {engine} database with invalid name {name:?}");
                        continue;
                    }
                    inventory.databases.entry(engine).or_default().push(name.to_string());
                }
                ["configs" | "firewall", ..] => inventory.system = true,
                _ => {}
            }
        }
        inventory
    }

    /// Type and scope of a backup with this content.
    fn infer_type(&self) -> (BackupType, String) {
        let database_count: usize = self.databases.values().map(Vec::len).sum();
        if self.system {
            return (BackupType::Full, String::new());
        }

        match (self.domains.len(), database_count) {
            (1, 0) => {
                let domain = self.domains.iter().next().cloned().unwrap_or_default();
                (BackupType::Domain, domain)
            }
            (0, 1) => {
                let scope = self
                    .databases
                    .iter()
                    .flat_map(|(engine, names)| names.iter().map(move |name| format!("{engine}:{name}")))
                    .next()
                    .unwrap_or_default();
                (BackupType::Database, scope)
            }
            _ => (BackupType::Full, String::new()),
        }
    }
}

impl<H: Host, R: ProcessRunner> Engine<H, R> {
    /// Copies the verified archive of `id` to `dest` and writes its sidecar.
    ///
    /// If `dest` is a directory the archive keeps its file name. Returns the
    /// path of the exported archive.
    pub fn export(&self, id: &str, dest: &Path) -> Result<PathBuf, EngineError> {
        let _lock = self.lock()?;

        let backup = self.catalog.get(id)?;
        if !self.catalog.verify(id)? {
            return Err(EngineError::ChecksumMismatch { id: backup.id });
        }

        let archive_file = self.catalog.archive_path(id, backup.compression);
        let target = match archive_file.file_name() {
            Some(file_name) if dest.is_dir() => dest.join(file_name),
            _ => dest.to_path_buf(),
        };

        fs::copy(&archive_file, &target).map_err(EngineError::io(&target))?;
        let sidecar = sidecar_path(&target);
        atomic::write_json_atomic(&sidecar, &backup).map_err(EngineError::io(&sidecar))?;

        log::info!(target: "engine::transfer", "Exported backup {id} to {}", target.display());
        Ok(target)
    }

    /// Imports the archive `src` as a new backup.
    ///
    /// A sidecar next to `src` provides type, scope and timestamp, and its
    /// checksum must match the archive. Without sidecar those are inferred
    /// from the archive's content.
    pub fn import(&self, src: &Path) -> Result<Backup, EngineError> {
        let _lock = self.lock()?;

        let compression = Compression::detect(src).map_err(EngineError::io(src))?;
        let checksum = checksum::sha256_file(src).map_err(EngineError::io(src))?;

        let sidecar_file = sidecar_path(src);
        let sidecar: Option<Backup> = match fs::read(&sidecar_file) {
            Ok(contents) => Some(serde_json::from_slice(&contents).map_err(|source| EngineError::Sidecar {
                path: sidecar_file.clone(),
                source,
            })?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(EngineError::Io {
                    path: sidecar_file,
                    source,
                })
            }
        };
        if let Some(sidecar) = &sidecar {
            if !sidecar.checksum.eq_ignore_ascii_case(&checksum) {
                return Err(EngineError::ChecksumMismatch {
                    id: sidecar.id.clone(),
                });
            }
        }

        let inventory = Inventory::of(&archive::list_archive(src, compression)?);
        let now = Utc::now();
        let (backup_type, scope, timestamp) = match &sidecar {
            Some(sidecar) => (sidecar.backup_type, sidecar.scope.clone(), sidecar.timestamp),
            None => {
                let (backup_type, scope) = inventory.infer_type();
                (backup_type, scope, now)
            }
        };

        let id = self.allocate_id(now);
        let archive_file = self.catalog.archive_path(&id, compression);
        fs::copy(src, &archive_file).map_err(EngineError::io(&archive_file))?;

        let recorded = (|| {
            let compressed_size = fs::metadata(&archive_file)
                .map_err(EngineError::io(&archive_file))?
                .len();
            let backup = Backup {
                id: id.clone(),
                timestamp,
                backup_type,
                scope,
                size_bytes: inventory.size_bytes,
                compressed_size,
                compression,
                checksum,
                verified: true,
                domains_included: inventory.domains.into_iter().collect(),
                databases_included: inventory.databases,
            };
            self.catalog.append(&backup)?;
            Ok::<_, EngineError>(backup)
        })();

        match recorded {
            Ok(backup) => {
                log::info!(target: "engine::transfer", "Imported {} as backup {id}", src.display());
                Ok(backup)
            }
            Err(e) => {
                if let Err(rm_err) = fs::remove_file(&archive_file) {
                    log::warn!(target: "engine::transfer", "Removing unrecorded archive {} failed: {rm_err}", archive_file.display());
                }
                Err(e)
            }
        }
    }
}
