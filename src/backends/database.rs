//! Logical dumps of single databases using the engines' native tools.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_more::{Display, Error};

use super::{Outcome, Unit};
use crate::config::DatabaseConfig;
use crate::util::process::{Invocation, ProcessError, ProcessRunner};

/// Database systems whose databases can be dumped.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    #[display("mysql")]
    Mysql,
    #[display("postgresql")]
    Postgresql,
}

impl DbEngine {
    pub const ALL: [DbEngine; 2] = [Self::Mysql, Self::Postgresql];
}

/// Database engine named by the user is unknown.
#[derive(Debug, Display, Error)]
#[display("Database engine is unknown: {_0}")]
pub struct UnknownEngine(#[error(ignore)] String);

impl FromStr for DbEngine {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgresql" | "postgres" | "pgsql" => Ok(Self::Postgresql),
            other => Err(UnknownEngine(other.to_string())),
        }
    }
}

/// A single database, written as `engine:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseRef {
    pub engine: DbEngine,
    pub name: String,
}

impl DatabaseRef {
    pub fn new(engine: DbEngine, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
        }
    }
}

impl fmt::Display for DatabaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine, self.name)
    }
}

#[derive(Debug, Display, Error)]
/// Errors on dumping or restoring a database.
pub enum DumpError {
    /// The dump tool could not be run or failed.
    #[display("Dump of {database} failed: {source}")]
    DumpFailed {
        database: String,
        source: ProcessError,
    },
    /// Creating the database or replaying the dump failed.
    ///
    /// The database is left in an undefined state.
    #[display("Restore of {database} failed: {source}")]
    RestoreFailed {
        database: String,
        source: ProcessError,
    },
    /// The archive holds no dump of the database.
    #[display("No dump of {database} found at {}", path.display())]
    MissingDump { database: String, path: PathBuf },
    #[display("Preparing {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Dumps and restores databases by running the engines' client tools.
#[derive(Debug, Clone)]
pub struct DatabaseDumper<R> {
    runner: R,
    config: DatabaseConfig,
}

impl<R: ProcessRunner> DatabaseDumper<R> {
    pub fn new(runner: R, config: DatabaseConfig) -> Self {
        Self { runner, config }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Dumps the database `name` to `<out_dir>/<name>.sql`.
    ///
    /// Dumps drop and recreate every object, so replaying one is idempotent.
    /// Returns the size of the dump. A failed dump leaves no file behind.
    pub fn dump(&self, engine: DbEngine, name: &str, out_dir: &Path) -> Result<u64, DumpError> {
        let database = DatabaseRef::new(engine, name).to_string();
        log::info!(target: "backend::database", "Create database dump of {database}");

        fs::create_dir_all(out_dir).map_err(|source| DumpError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;
        let dump_file = out_dir.join(format!("{name}.sql"));
        log::debug!(target: "backend::database", "Save dump of {database} at: {}", dump_file.display());

        let invocation = match engine {
            DbEngine::Mysql => Invocation::new("mysqldump")
                .args(self.config.client_args(engine))
                .args(["--opt", "--single-transaction", "--routines", "--triggers"])
                .arg(name),
            DbEngine::Postgresql => Invocation::new("pg_dump")
                .args(self.config.client_args(engine))
                .args(["--clean", "--if-exists", "--no-owner"])
                .arg(name),
        }
        .stdout_file(&dump_file)
        .timeout(self.config.timeout());

        if let Err(source) = self.runner.run(&invocation) {
            if let Err(e) = fs::remove_file(&dump_file) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!(target: "backend::database", "Removing partial dump {} failed: {e}", dump_file.display());
                }
            }
            return Err(DumpError::DumpFailed { database, source });
        }

        let size = fs::metadata(&dump_file)
            .map_err(|source| DumpError::Io {
                path: dump_file.clone(),
                source,
            })?
            .len();
        log::info!(target: "backend::database", "Finished dump of {database} ({size} bytes)");

        Ok(size)
    }

    /// Creates the database `name` if it is absent and replays `sql_file` into it.
    ///
    /// Not retried on failure, the database is then in an undefined state.
    pub fn restore(&self, engine: DbEngine, name: &str, sql_file: &Path) -> Result<(), DumpError> {
        let database = DatabaseRef::new(engine, name).to_string();
        log::info!(target: "backend::database", "Restore {database} from {}", sql_file.display());

        let failed = |source| DumpError::RestoreFailed {
            database: database.clone(),
            source,
        };
        let client_args = self.config.client_args(engine);
        let timeout = self.config.timeout();

        match engine {
            DbEngine::Mysql => {
                let create = Invocation::new("mysql")
                    .args(client_args.clone())
                    .arg("-e")
                    .arg(format!("CREATE DATABASE IF NOT EXISTS `{name}`"))
                    .timeout(timeout);
                self.runner.run(&create).map_err(failed)?;

                let replay = Invocation::new("mysql")
                    .args(client_args)
                    .arg(name)
                    .stdin_file(sql_file)
                    .timeout(timeout);
                self.runner.run(&replay).map_err(failed)?;
            }
            DbEngine::Postgresql => {
                let exists = Invocation::new("psql")
                    .args(client_args.clone())
                    .args(["--no-align", "--tuples-only", "--dbname=postgres", "--command"])
                    .arg(format!("SELECT 1 FROM pg_database WHERE datname = '{name}'"))
                    .timeout(timeout);
                let found = self.runner.run(&exists).map_err(failed)?;

                if found.stdout.trim() != "1" {
                    let create = Invocation::new("psql")
                        .args(client_args.clone())
                        .args(["--dbname=postgres", "--command"])
                        .arg(format!("CREATE DATABASE \"{name}\""))
                        .timeout(timeout);
                    self.runner.run(&create).map_err(failed)?;
                }

                let replay = Invocation::new("psql")
                    .args(client_args)
                    .args(["--set=ON_ERROR_STOP=1", "--quiet"])
                    .arg(format!("--dbname={name}"))
                    .stdin_file(sql_file)
                    .timeout(timeout);
                self.runner.run(&replay).map_err(failed)?;
            }
        }

        log::info!(target: "backend::database", "Finished restore of {database}");
        Ok(())
    }
}

/// The [Unit] of a single database, staged as `databases/<engine>/<name>.sql`.
pub struct Database<'a, R> {
    dumper: &'a DatabaseDumper<R>,
    database: &'a DatabaseRef,
}

impl<'a, R> Database<'a, R> {
    pub fn new(dumper: &'a DatabaseDumper<R>, database: &'a DatabaseRef) -> Self {
        Self { dumper, database }
    }

    fn staged_dir(&self, staging: &Path) -> PathBuf {
        staging
            .join("databases")
            .join(self.database.engine.to_string())
    }
}

impl<R: ProcessRunner> Unit for Database<'_, R> {
    type Error = DumpError;

    fn label(&self) -> String {
        format!("database {}", self.database)
    }

    fn collect(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let DatabaseRef { engine, name } = self.database;
        self.dumper
            .dump(*engine, name, &self.staged_dir(staging))
            .map(|_| Outcome::Done)
    }

    fn restore(&self, staging: &Path) -> Result<Outcome, Self::Error> {
        let DatabaseRef { engine, name } = self.database;
        let sql_file = self.staged_dir(staging).join(format!("{name}.sql"));
        if !sql_file.is_file() {
            return Err(DumpError::MissingDump {
                database: self.database.to_string(),
                path: sql_file,
            });
        }

        self.dumper
            .restore(*engine, name, &sql_file)
            .map(|()| Outcome::Done)
    }
}
