use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use super::record::{Backup, BackupType};
use super::staging::StagingDir;
use super::{scope, Engine, EngineError};
use crate::backends::{Database, DomainCertificate, HostMetadata, Outcome, Site, SystemItem, Unit};
use crate::host::Host;
use crate::util::archive::{self, Compression};
use crate::util::checksum;
use crate::util::process::ProcessRunner;

/// What to back up.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub backup_type: BackupType,
    /// Domain or `engine:name`, required for domain and database backups.
    pub scope: Option<String>,
    pub compression: Compression,
}

/// A unit left out of a full backup because collecting it failed.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{unit}: {message}")]
pub struct CollectionWarning {
    pub unit: String,
    pub message: String,
}

/// Result of [Engine::create].
#[derive(Debug, Clone)]
pub struct CreateReport {
    pub backup: Backup,
    pub warnings: Vec<CollectionWarning>,
}

/// Collects units into a staging directory, applying the failure policy.
struct Collector<'a> {
    staging: &'a Path,
    /// Whether a failing unit fails the whole backup.
    strict: bool,
    warnings: Vec<CollectionWarning>,
}

impl Collector<'_> {
    /// Collects `unit`, returning whether it ended up in the staging directory.
    fn collect<U>(&mut self, unit: &U) -> Result<bool, EngineError>
    where
        U: Unit,
        U::Error: Display + Into<EngineError>,
    {
        match unit.collect(self.staging) {
            Ok(Outcome::Done) => Ok(true),
            Ok(Outcome::Absent) => Ok(false),
            Err(e) if self.strict => Err(e.into()),
            Err(e) => {
                self.warn(unit.label(), e);
                Ok(false)
            }
        }
    }

    fn warn(&mut self, unit: String, error: impl Display) {
        log::warn!(target: "engine::create", "Leaving out {unit}: {error}");
        self.warnings.push(CollectionWarning {
            unit,
            message: error.to_string(),
        });
    }
}

impl<H: Host, R: ProcessRunner> Engine<H, R> {
    /// Creates a backup as described by `request`.
    pub fn create(&self, request: &CreateRequest) -> Result<CreateReport, EngineError> {
        self.create_at(request, Utc::now())
    }

    /// Creates a backup as if it was `now`.
    ///
    /// Inside a full backup a failing unit is left out and reported as
    /// [CollectionWarning]. For domain and database backups it is fatal.
    pub fn create_at(&self, request: &CreateRequest, now: DateTime<Utc>) -> Result<CreateReport, EngineError> {
        let _lock = self.lock()?;

        let selection = scope::resolve(request.backup_type, request.scope.as_deref(), &self.host)?;
        let id = self.allocate_id(now);
        log::info!(
            target: "engine::create",
            "Create {} backup {id} ({} domains, {} databases)",
            request.backup_type,
            selection.domains.len(),
            selection.databases.len()
        );

        let resolved_scope = match request.backup_type {
            BackupType::Full => String::new(),
            BackupType::Domain | BackupType::Database => selection
                .domains
                .iter()
                .cloned()
                .chain(selection.databases.iter().map(ToString::to_string))
                .next()
                .unwrap_or_default(),
        };

        let root = &self.config.backup_root;
        let staging = StagingDir::create(root, &format!("create-{id}"))
            .map_err(EngineError::io(&root.join("staging")))?;
        let full = request.backup_type == BackupType::Full;
        let mut collector = Collector {
            staging: staging.path(),
            strict: !full,
            warnings: Vec::new(),
        };

        // never fatal
        let metadata = HostMetadata::new(&self.config.state_dir);
        if let Err(e) = metadata.collect(staging.path()) {
            collector.warn(metadata.label(), e);
        }

        let mut domains_included = Vec::new();
        for domain in &selection.domains {
            if collector.collect(&Site::new(&self.config.www_root, domain))? {
                domains_included.push(domain.clone());
                if full {
                    let located = self.host.locate_certificate(domain);
                    collector.collect(&DomainCertificate::new(domain, located, &self.config.paths.ssl))?;
                }
            }
        }

        let mut databases_included: BTreeMap<_, Vec<String>> = BTreeMap::new();
        for database in &selection.databases {
            if collector.collect(&Database::new(&self.dumper, database))? {
                databases_included
                    .entry(database.engine)
                    .or_default()
                    .push(database.name.clone());
            }
        }

        if full {
            for item in SystemItem::all(&self.config.paths) {
                collector.collect(&item)?;
            }
        }
        let warnings = collector.warnings;

        let archive_file = self.catalog.archive_path(&id, request.compression);
        let size_bytes = archive::create_archive(staging.path(), &archive_file, request.compression)?;

        let recorded = (|| {
            let checksum = checksum::sha256_file(&archive_file).map_err(EngineError::io(&archive_file))?;
            let compressed_size = fs::metadata(&archive_file)
                .map_err(EngineError::io(&archive_file))?
                .len();
            let backup = Backup {
                id: id.clone(),
                timestamp: now,
                backup_type: request.backup_type,
                scope: resolved_scope,
                size_bytes,
                compressed_size,
                compression: request.compression,
                checksum,
                verified: true,
                domains_included,
                databases_included,
            };
            self.catalog.append(&backup)?;
            Ok::<_, EngineError>(backup)
        })();

        let backup = match recorded {
            Ok(backup) => backup,
            Err(e) => {
                if let Err(rm_err) = fs::remove_file(&archive_file) {
                    log::warn!(target: "engine::create", "Removing unrecorded archive {} failed: {rm_err}", archive_file.display());
                }
                return Err(e);
            }
        };

        log::info!(
            target: "engine::create",
            "Finished backup {}: {} bytes, {} bytes compressed, {} warnings",
            backup.id,
            backup.size_bytes,
            backup.compressed_size,
            warnings.len()
        );
        Ok(CreateReport { backup, warnings })
    }
}
