//! The [Backup] record stored in the catalog.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use derive_more::Display;

use crate::backends::{DatabaseRef, DbEngine};
use crate::util::archive::Compression;

/// What a backup covers.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    ValueEnum,
    Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Every domain, every database and the system configuration.
    #[default]
    #[display("full")]
    Full,
    /// A single domain's web root and certificate.
    #[display("domain")]
    Domain,
    /// A single database.
    #[display("database")]
    Database,
}

/// Catalog entry describing one archive.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Backup {
    /// Unique id, derived from the creation time.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    /// Domain name or `engine:name`. Empty for full backups.
    #[serde(default)]
    pub scope: String,
    /// Size of all archived files before compression.
    pub size_bytes: u64,
    /// Size of the archive file.
    pub compressed_size: u64,
    pub compression: Compression,
    /// SHA-256 of the archive file, hex encoded.
    pub checksum: String,
    /// Set once the checksum was computed on creation or import.
    pub verified: bool,
    #[serde(default)]
    pub domains_included: Vec<String>,
    #[serde(default)]
    pub databases_included: BTreeMap<DbEngine, Vec<String>>,
}

impl Backup {
    /// Whether the backup contains `domain`, either as included domain or as
    /// the scope of a domain backup.
    pub fn includes_domain(&self, domain: &str) -> bool {
        self.domains_included.iter().any(|d| d == domain)
            || (self.backup_type == BackupType::Domain && self.scope == domain)
    }

    /// All included databases.
    pub fn database_refs(&self) -> Vec<DatabaseRef> {
        self.databases_included
            .iter()
            .flat_map(|(engine, names)| names.iter().map(|name| DatabaseRef::new(*engine, name.as_str())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Backup {
        Backup {
            id: "20240520-120000".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2024-05-20T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            backup_type: BackupType::Full,
            scope: String::new(),
            size_bytes: 11,
            compressed_size: 120,
            compression: Compression::Gzip,
            checksum: "ab".repeat(32),
            verified: true,
            domains_included: vec!["example.com".to_string()],
            databases_included: BTreeMap::from([
                (DbEngine::Mysql, vec!["shop".to_string()]),
                (DbEngine::Postgresql, vec!["blog".to_string()]),
            ]),
        }
    }

    #[test]
    fn serializes_field_names() {
        let json: serde_json::Value = serde_json::to_value(record()).unwrap();

        assert_eq!(json["type"], "full");
        assert_eq!(json["compression"], "gzip");
        assert_eq!(json["timestamp"], "2024-05-20T12:00:00Z");
        assert_eq!(json["databases_included"]["mysql"][0], "shop");
        assert_eq!(json["databases_included"]["postgresql"][0], "blog");
    }

    #[test]
    fn lists_database_refs() {
        assert_eq!(
            record().database_refs(),
            [
                DatabaseRef::new(DbEngine::Mysql, "shop"),
                DatabaseRef::new(DbEngine::Postgresql, "blog")
            ]
        );
    }

    #[test]
    fn domain_scope_counts_as_included() {
        let mut backup = record();
        backup.backup_type = BackupType::Domain;
        backup.scope = "other.example".to_string();
        backup.domains_included.clear();

        assert!(backup.includes_domain("other.example"));
        assert!(!backup.includes_domain("example.com"));
    }
}
