use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::engine::BackupType;
use crate::util::archive::Compression;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. Created with default values if it doesn't exist.
    #[arg(long, global = true, env = "WS_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Create a new backup.
    Create(CreateArgs),
    /// List backups, oldest first.
    List(ListArgs),
    /// Check the archive of a backup against its recorded checksum.
    Verify {
        /// Id of the backup.
        id: String,
    },
    /// Restore a backup, or a single domain of it.
    Restore {
        /// Id of the backup.
        id: String,
        /// Only restore this domain (plus host metadata and databases).
        #[arg(long)]
        domain: Option<String>,
    },
    /// Delete a backup.
    Delete {
        /// Id of the backup.
        id: String,
    },
    /// Copy a verified backup and its record out of the backup root.
    Export {
        /// Id of the backup.
        id: String,
        /// Destination file or directory.
        dest: PathBuf,
    },
    /// Add an archive, e.g. exported on another host, as new backup.
    Import {
        /// Archive to import. A sidecar `<archive>.json` is used if present.
        src: PathBuf,
    },
    /// Delete backups older than the retention period.
    Sweep {
        /// Days to keep backups. Defaults to the scheduled retention.
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Manage daily scheduled backups.
    #[command(subcommand)]
    Schedule(ScheduleAction),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// What to back up.
    #[arg(long = "type", short = 't', default_value_t = BackupType::Full)]
    pub backup_type: BackupType,

    /// Domain or `engine:name` for domain and database backups.
    #[arg(long, short = 's')]
    pub scope: Option<String>,

    /// Compression of the archive.
    #[arg(long, short = 'c', default_value_t = Compression::Gzip)]
    pub compression: Compression,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only backups including this domain.
    #[arg(long)]
    pub domain: Option<String>,

    /// Only backups since this point in time, e.g. `7d`, `12h`, `2024-05-01`.
    #[arg(long)]
    pub since: Option<String>,

    /// Print the records as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleAction {
    /// Install daily backups and retention sweeps.
    Enable {
        /// Local time of day, `HH:MM`.
        #[arg(long, default_value = "02:00")]
        time: String,

        #[arg(long = "type", short = 't', default_value_t = BackupType::Full)]
        backup_type: BackupType,

        /// Domain or `engine:name` for domain and database backups.
        #[arg(long, short = 's')]
        scope: Option<String>,

        /// Days to keep backups.
        #[arg(long, default_value = "30")]
        retention_days: u32,

        #[arg(long, short = 'c', default_value_t = Compression::Gzip)]
        compression: Compression,
    },
    /// Remove the scheduled backups. Existing backups are kept.
    Disable,
    /// Show whether backups are scheduled and when the next one runs.
    Status,
}

/// Formats `bytes` with a binary unit.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
