//! Configuration of the backup engine, stored as TOML.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::backends::database::DbEngine;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ws-backup/config.toml";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Configuration of the whole engine.
pub struct EngineConfig {
    /// Directory holding archives, catalog records and the schedule policy.
    pub backup_root: PathBuf,
    /// Parent directory of the per domain web roots.
    pub www_root: PathBuf,
    /// Directory with the host's `domains.json`, `ssl.json` and `mail.json`.
    pub state_dir: PathBuf,
    pub paths: SystemPaths,
    pub database: DatabaseConfig,
    pub services: ServicesConfig,
    pub schedule: ScheduleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_root: "/var/backups/ws-backup".into(),
            www_root: "/var/www".into(),
            state_dir: "/etc/ws-backup/state".into(),
            paths: Default::default(),
            database: Default::default(),
            services: Default::default(),
            schedule: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Locations of configuration, certificates and firewall rules on the host.
pub struct SystemPaths {
    pub nginx: PathBuf,
    pub apache2: PathBuf,
    /// Self-signed and manually installed certificates (`<domain>.crt`/`<domain>.key`).
    pub ssl: PathBuf,
    pub letsencrypt: PathBuf,
    pub firewall_v4: PathBuf,
    pub firewall_v6: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            nginx: "/etc/nginx".into(),
            apache2: "/etc/apache2".into(),
            ssl: "/etc/ssl/ws-backup".into(),
            letsencrypt: "/etc/letsencrypt".into(),
            firewall_v4: "/etc/iptables/rules.v4".into(),
            firewall_v6: "/etc/iptables/rules.v6".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Access to the database engines.
pub struct DatabaseConfig {
    /// User for `mysqldump`/`mysql`. Unset uses the client defaults (e.g. `~/.my.cnf`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_user: Option<String>,
    /// Role for `pg_dump`/`psql`.
    pub postgres_user: String,
    /// Upper bound for a single dump or restore. `0` disables the timeout.
    pub timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            mysql_user: None,
            postgres_user: "postgres".to_string(),
            timeout_secs: 3600,
        }
    }
}

impl DatabaseConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Connection arguments shared by all client tools of `engine`.
    pub fn client_args(&self, engine: DbEngine) -> Vec<String> {
        match engine {
            DbEngine::Mysql => self
                .mysql_user
                .iter()
                .map(|user| format!("--user={user}"))
                .collect(),
            DbEngine::Postgresql => vec![format!("--username={}", self.postgres_user)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Services reloaded after a restore, if they are active.
    pub reload: Vec<String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            reload: ["nginx", "apache2", "php-fpm"].map(String::from).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Directory for the cron entries of scheduled backups.
    pub cron_dir: PathBuf,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron_dir: "/etc/cron.d".into(),
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on reading or writing the configuration.
pub enum ConfigError {
    #[display("Reading the config file {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[display("Parsing the config file {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[display("Writing the config file {} failed: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[from]
    #[display("Serializing the config failed: {_0}")]
    Serialize(toml::ser::Error),
}

impl EngineConfig {
    /// Reads the configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&config_str).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads the configuration from `path`, writing the default config there
    /// if it doesn't exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                if let Err(e) = default_config.save(path) {
                    log::warn!(target: "config", "{e}");
                }
                Ok(default_config)
            }
            other => other,
        }
    }

    /// Writes the configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let config_str = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, config_str).map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = EngineConfig::default();
        config.database.mysql_user = Some("backup".to_string());
        config.save(&path).unwrap();

        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "backup_root = \"/srv/backups\"\n[database]\ntimeout_secs = 0\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(config.www_root, PathBuf::from("/var/www"));
        assert_eq!(config.database.postgres_user, "postgres");
        assert_eq!(config.database.timeout(), None);
    }

    #[test]
    fn missing_config_is_initialised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/config.toml");

        let config = EngineConfig::load_or_init(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "backup_root = [").unwrap();

        assert!(matches!(
            EngineConfig::load_or_init(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn client_args_per_engine() {
        let mut config = DatabaseConfig::default();
        assert!(config.client_args(DbEngine::Mysql).is_empty());

        config.mysql_user = Some("root".to_string());
        assert_eq!(config.client_args(DbEngine::Mysql), vec!["--user=root"]);
        assert_eq!(
            config.client_args(DbEngine::Postgresql),
            vec!["--username=postgres"]
        );
    }
}
