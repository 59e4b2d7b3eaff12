use std::fmt::Display;
use std::path::Path;

use super::scope::ScopeError;
use super::staging::StagingDir;
use super::{Engine, EngineError};
use crate::backends::{Database, DomainCertificate, HostMetadata, Outcome, Site, SystemItem, Unit};
use crate::host::Host;
use crate::util::archive;
use crate::util::process::ProcessRunner;

/// A unit which could not be restored.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{unit}: {message}")]
pub struct RestoreFailure {
    pub unit: String,
    pub message: String,
}

/// Result of [Engine::restore].
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub id: String,
    /// Number of units written back to the host.
    pub items_restored: usize,
    pub failures: Vec<RestoreFailure>,
    /// Set if reloading the services failed afterwards.
    pub reload_warning: Option<String>,
}

impl RestoreReport {
    /// Restores `unit`, recording its outcome. Never stops the restore.
    fn restore<U>(&mut self, unit: &U, staging: &Path)
    where
        U: Unit,
        U::Error: Display,
    {
        match unit.restore(staging) {
            Ok(Outcome::Done) => self.items_restored += 1,
            Ok(Outcome::Absent) => {
                log::debug!(target: "engine::restore", "Nothing to restore for {}", unit.label());
            }
            Err(e) => {
                log::warn!(target: "engine::restore", "Restoring {} failed: {e}", unit.label());
                self.failures.push(RestoreFailure {
                    unit: unit.label(),
                    message: e.to_string(),
                });
            }
        }
    }
}

impl<H: Host, R: ProcessRunner> Engine<H, R> {
    /// Restores the backup `id`, or only the domain `domain` of it.
    ///
    /// Host metadata and the included databases are always restored. System
    /// configuration only if no domain is given. Units are restored
    /// independently of each other; their failures are collected in the
    /// [RestoreReport].
    pub fn restore(&self, id: &str, domain: Option<&str>) -> Result<RestoreReport, EngineError> {
        let _lock = self.lock()?;

        let backup = self.catalog.get(id)?;
        if let Some(domain) = domain {
            if !backup.includes_domain(domain) {
                return Err(ScopeError::NotInBackup {
                    domain: domain.to_string(),
                    id: backup.id,
                }
                .into());
            }
        }
        if !self.catalog.verify(id)? {
            return Err(EngineError::ChecksumMismatch { id: backup.id });
        }

        let root = &self.config.backup_root;
        let staging = StagingDir::create(root, &format!("restore-{id}"))
            .map_err(EngineError::io(&root.join("staging")))?;
        let archive_file = self.catalog.archive_path(id, backup.compression);
        log::info!(target: "engine::restore", "Extract backup {id} from {}", archive_file.display());
        archive::extract_archive(&archive_file, staging.path(), backup.compression)?;

        let mut report = RestoreReport {
            id: backup.id.clone(),
            ..Default::default()
        };
        let staged = staging.path();

        report.restore(&HostMetadata::new(&self.config.state_dir), staged);

        let domains: Vec<&str> = match domain {
            Some(domain) => vec![domain],
            None => backup.domains_included.iter().map(String::as_str).collect(),
        };
        for name in domains {
            report.restore(&Site::new(&self.config.www_root, name), staged);
            let located = self.host.locate_certificate(name);
            report.restore(&DomainCertificate::new(name, located, &self.config.paths.ssl), staged);
        }

        for database in backup.database_refs() {
            report.restore(&Database::new(&self.dumper, &database), staged);
        }

        if domain.is_none() {
            for item in SystemItem::all(&self.config.paths) {
                report.restore(&item, staged);
            }
        }

        if let Err(e) = self.host.reload_services() {
            log::warn!(target: "engine::restore", "Reloading services failed: {e}");
            report.reload_warning = Some(e.to_string());
        }

        log::info!(
            target: "engine::restore",
            "Finished restore of {id}: {} items restored, {} failed",
            report.items_restored,
            report.failures.len()
        );
        Ok(report)
    }
}
