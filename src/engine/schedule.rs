//! Daily scheduled backups and retention sweeps using cron.
//!
//! Enabling a schedule installs two entries in the cron directory, one
//! creating the backup and one sweeping expired backups an hour later. The
//! policy itself is stored as `<backup_root>/schedule.json`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone, Timelike, Utc};
use derive_more::{Display, Error};

use super::record::BackupType;
use crate::util::archive::Compression;
use crate::util::atomic;

const POLICY_FILE: &str = "schedule.json";
const BACKUP_CRON_FILE: &str = "ws-backup";
const RETENTION_CRON_FILE: &str = "ws-backup-retention";

#[derive(Debug, Display, Error)]
/// Errors on managing the schedule.
pub enum ScheduleError {
    #[display("Invalid time {_0:?}, expected HH:MM")]
    InvalidTime(#[error(ignore)] String),
    #[display("Retention must keep backups for at least one day")]
    InvalidRetention,
    #[display("A scheduled {_0} backup requires a scope")]
    MissingScope(#[error(ignore)] BackupType),
    #[display("Accessing {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[display("Schedule policy {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl ScheduleError {
    fn io(path: &Path) -> impl Fn(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The persisted schedule.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulePolicy {
    pub enabled: bool,
    /// Local time of day of the backup, `HH:MM`.
    pub time: String,
    pub backup_type: BackupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Backups older than this many days are swept.
    pub retention_days: u32,
    pub compression: Compression,
    pub updated_at: DateTime<Utc>,
}

/// Report of [Scheduler::status].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub next_run: Option<DateTime<Local>>,
    pub policy: Option<SchedulePolicy>,
}

/// Command line run by cron.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Path of the `ws-backup` executable.
    pub program: PathBuf,
    /// Config file passed with `--config`.
    pub config: PathBuf,
}

/// Installs and removes the cron entries of scheduled backups.
#[derive(Debug, Clone)]
pub struct Scheduler {
    policy_path: PathBuf,
    cron_dir: PathBuf,
    trigger: Trigger,
}

/// Parses a time of day given as `HH:MM`.
pub fn parse_time(time: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(time.trim(), "%H:%M").map_err(|_| ScheduleError::InvalidTime(time.to_string()))
}

/// Next local occurrence of `time` after `now`.
pub fn next_run(time: NaiveTime, now: DateTime<Local>) -> Option<DateTime<Local>> {
    let today = now.date_naive();
    // skips days on which `time` falls into a DST gap
    (0..=2)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .filter_map(|day| Local.from_local_datetime(&day.and_time(time)).earliest())
        .find(|run| *run > now)
}

/// Quotes `arg` for `/bin/sh` within a crontab line.
fn quote(arg: &str) -> String {
    let arg = arg.replace('\'', r"'\''").replace('%', r"\%");
    format!("'{arg}'")
}

impl Scheduler {
    pub fn new(backup_root: &Path, cron_dir: &Path, trigger: Trigger) -> Self {
        Self {
            policy_path: backup_root.join(POLICY_FILE),
            cron_dir: cron_dir.to_path_buf(),
            trigger,
        }
    }

    fn command(&self) -> String {
        format!(
            "{} --config {}",
            quote(&self.trigger.program.to_string_lossy()),
            quote(&self.trigger.config.to_string_lossy())
        )
    }

    fn backup_entry(&self, time: NaiveTime, policy: &SchedulePolicy) -> String {
        let mut command = format!(
            "{} create --type {} --compression {}",
            self.command(),
            policy.backup_type,
            policy.compression
        );
        if let Some(scope) = &policy.scope {
            command.push_str(&format!(" --scope {}", quote(scope)));
        }
        cron_file(time.minute(), time.hour(), &command)
    }

    fn retention_entry(&self, time: NaiveTime, policy: &SchedulePolicy) -> String {
        let command = format!(
            "{} sweep --retention-days {}",
            self.command(),
            policy.retention_days
        );
        cron_file(time.minute(), (time.hour() + 1) % 24, &command)
    }

    /// The stored policy, if a schedule was ever enabled.
    pub fn policy(&self) -> Result<Option<SchedulePolicy>, ScheduleError> {
        let contents = match fs::read(&self.policy_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ScheduleError::Io {
                    path: self.policy_path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| ScheduleError::Malformed {
                path: self.policy_path.clone(),
                source,
            })
    }

    /// Enables daily backups at `time` (`HH:MM`, local time).
    pub fn enable(
        &self,
        time: &str,
        backup_type: BackupType,
        scope: Option<String>,
        retention_days: u32,
        compression: Compression,
    ) -> Result<SchedulePolicy, ScheduleError> {
        let parsed = parse_time(time)?;
        if retention_days == 0 {
            return Err(ScheduleError::InvalidRetention);
        }
        let scope = scope.filter(|scope| !scope.trim().is_empty());
        if backup_type != BackupType::Full && scope.is_none() {
            return Err(ScheduleError::MissingScope(backup_type));
        }

        let policy = SchedulePolicy {
            enabled: true,
            time: parsed.format("%H:%M").to_string(),
            backup_type,
            scope,
            retention_days,
            compression,
            updated_at: Utc::now(),
        };

        fs::create_dir_all(&self.cron_dir).map_err(ScheduleError::io(&self.cron_dir))?;
        for (name, entry) in [
            (BACKUP_CRON_FILE, self.backup_entry(parsed, &policy)),
            (RETENTION_CRON_FILE, self.retention_entry(parsed, &policy)),
        ] {
            let path = self.cron_dir.join(name);
            atomic::write_atomic(&path, entry.as_bytes()).map_err(ScheduleError::io(&path))?;
        }
        atomic::write_json_atomic(&self.policy_path, &policy).map_err(ScheduleError::io(&self.policy_path))?;

        log::info!(
            target: "engine::schedule",
            "Scheduled daily {} backups at {}, keeping {} days",
            policy.backup_type,
            policy.time,
            policy.retention_days
        );
        Ok(policy)
    }

    /// Removes the cron entries and marks the policy inactive.
    ///
    /// Existing backups are kept.
    pub fn disable(&self) -> Result<Option<SchedulePolicy>, ScheduleError> {
        for name in [BACKUP_CRON_FILE, RETENTION_CRON_FILE] {
            let path = self.cron_dir.join(name);
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    return Err(ScheduleError::Io { path, source: e })
                }
                _ => {}
            }
        }

        let Some(mut policy) = self.policy()? else {
            log::info!(target: "engine::schedule", "No schedule was enabled");
            return Ok(None);
        };
        policy.enabled = false;
        policy.updated_at = Utc::now();
        atomic::write_json_atomic(&self.policy_path, &policy).map_err(ScheduleError::io(&self.policy_path))?;

        log::info!(target: "engine::schedule", "Disabled scheduled backups");
        Ok(Some(policy))
    }

    /// Whether scheduled backups are enabled and when the next one runs.
    pub fn status(&self, now: DateTime<Local>) -> Result<ScheduleStatus, ScheduleError> {
        let policy = self.policy()?;
        let enabled = policy.as_ref().is_some_and(|policy| policy.enabled)
            && self.cron_dir.join(BACKUP_CRON_FILE).is_file();
        let next_run = policy
            .as_ref()
            .filter(|_| enabled)
            .and_then(|policy| parse_time(&policy.time).ok())
            .and_then(|time| next_run(time, now));

        Ok(ScheduleStatus {
            enabled,
            next_run,
            policy,
        })
    }
}

fn cron_file(minute: u32, hour: u32, command: &str) -> String {
    format!(
        "# Installed by ws-backup, changes are overwritten.\n\
         SHELL=/bin/sh\n\
         PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n\
         {minute} {hour} * * * root {command}\n"
    )
}
