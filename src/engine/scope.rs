//! Resolution of a backup type and scope into the units to collect.

use std::sync::LazyLock;

use derive_more::{Display, Error, From};
use regex::Regex;

use super::record::BackupType;
use crate::backends::database::UnknownEngine;
use crate::backends::{DatabaseRef, DbEngine};
use crate::host::{Host, HostError};

static DOMAIN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?)*$")
        .unwrap()
});
static DATABASE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_$-]{1,64}$").unwrap());

/// Whether `domain` is a host name that is safe to use as path component.
pub fn valid_domain(domain: &str) -> bool {
    DOMAIN_NAME.is_match(domain)
}

/// Whether `name` is safe to use as path component and inside SQL identifiers.
pub fn valid_database(name: &str) -> bool {
    DATABASE_NAME.is_match(name)
}

#[derive(Debug, Display, Error, From)]
/// Errors on resolving what to back up or restore.
pub enum ScopeError {
    #[display("A {_0} backup requires a scope")]
    MissingScope(#[error(ignore)] BackupType),
    #[display("Domain {_0} is not hosted here")]
    UnknownDomain(#[error(ignore)] String),
    #[display("{_0:?} is not a valid name")]
    InvalidName(#[error(ignore)] String),
    #[from]
    UnknownEngine(UnknownEngine),
    #[from]
    Host(HostError),
    #[display("Backup {id} does not include domain {domain}")]
    NotInBackup { domain: String, id: String },
}

/// Units selected for collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub domains: Vec<String>,
    pub databases: Vec<DatabaseRef>,
}

/// Parses `engine:name`. Unqualified names refer to a MySQL database.
pub fn parse_database_ref(scope: &str) -> Result<DatabaseRef, ScopeError> {
    let (engine, name) = match scope.split_once(':') {
        Some((engine, name)) => (engine.parse::<DbEngine>()?, name),
        None => (DbEngine::Mysql, scope),
    };

    if !valid_database(name) {
        return Err(ScopeError::InvalidName(name.to_string()));
    }
    Ok(DatabaseRef::new(engine, name))
}

fn non_empty(backup_type: BackupType, scope: Option<&str>) -> Result<&str, ScopeError> {
    scope
        .map(str::trim)
        .filter(|scope| !scope.is_empty())
        .ok_or(ScopeError::MissingScope(backup_type))
}

/// Resolves `backup_type` and `scope` into a [Selection].
///
/// Full backups select every hosted domain and every database of every
/// reachable engine. Engines which can't be listed are skipped with a
/// warning, as are names that are unsafe to use as paths.
pub fn resolve<H: Host + ?Sized>(
    backup_type: BackupType,
    scope: Option<&str>,
    host: &H,
) -> Result<Selection, ScopeError> {
    match backup_type {
        BackupType::Full => {
            let domains = host
                .list_domains()?
                .into_iter()
                .filter(|domain| {
                    let valid = valid_domain(domain);
                    if !valid {
                        log::warn!(target: "engine::scope", "Skipping domain with invalid name {domain:?}");
                    }
                    valid
                })
                .collect();

            let mut databases = Vec::new();
            for engine in DbEngine::ALL {
                match host.list_databases(engine) {
                    Ok(names) => databases.extend(
                        names
                            .into_iter()
                            .filter(|name| {
                                let valid = valid_database(name);
                                if !valid {
                                    log::warn!(target: "engine::scope", "Skipping {engine} database with invalid name {name:?}");
                                }
                                valid
                            })
                            .map(|name| DatabaseRef::new(engine, name)),
                    ),
                    Err(e) => {
                        log::warn!(target: "engine::scope", "Skipping {engine} databases: {e}");
                    }
                }
            }

            Ok(Selection { domains, databases })
        }
        BackupType::Domain => {
            let domain = non_empty(backup_type, scope)?;
            if !valid_domain(domain) {
                return Err(ScopeError::InvalidName(domain.to_string()));
            }
            if !host.list_domains()?.iter().any(|known| known == domain) {
                return Err(ScopeError::UnknownDomain(domain.to_string()));
            }

            Ok(Selection {
                domains: vec![domain.to_string()],
                databases: Vec::new(),
            })
        }
        BackupType::Database => {
            let database = parse_database_ref(non_empty(backup_type, scope)?)?;
            Ok(Selection {
                domains: Vec::new(),
                databases: vec![database],
            })
        }
    }
}
