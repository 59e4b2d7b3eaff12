use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{Local, Utc};
use clap::Parser;
use derive_more::{Display, Error, From};

use ws_backup_lib::cli::{human_bytes, Action, Cli, CreateArgs, ListArgs, ScheduleAction};
use ws_backup_lib::config::{ConfigError, EngineConfig};
use ws_backup_lib::engine::schedule::{ScheduleError, Scheduler, Trigger};
use ws_backup_lib::engine::{Backup, CreateRequest, Engine, EngineError, ListFilter};
use ws_backup_lib::host::LocalHost;
use ws_backup_lib::util::process::SystemRunner;
use ws_backup_lib::util::retention::{self, InvalidAge};

const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Display, Error, From)]
enum CommandError {
    #[from]
    Config(ConfigError),
    #[from]
    Engine(EngineError),
    #[from]
    Schedule(ScheduleError),
    #[from]
    Age(InvalidAge),
    #[display("Serializing the output failed: {_0}")]
    #[from]
    Json(serde_json::Error),
    #[display("Backup {_0} failed verification")]
    Corrupt(#[error(ignore)] String),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CommandError> {
    let config = EngineConfig::load_or_init(&cli.config)?;
    let scheduler = Scheduler::new(
        &config.backup_root,
        &config.schedule.cron_dir,
        Trigger {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ws-backup")),
            config: std::path::absolute(&cli.config).unwrap_or_else(|_| cli.config.clone()),
        },
    );

    let host = LocalHost::new(SystemRunner, &config);
    let engine = Engine::open(config, host, SystemRunner)?;

    match cli.action {
        Action::Create(CreateArgs {
            backup_type,
            scope,
            compression,
        }) => {
            let report = engine.create(&CreateRequest {
                backup_type,
                scope,
                compression,
            })?;
            let backup = &report.backup;
            println!(
                "Created {} backup {} ({}, {} compressed)",
                backup.backup_type,
                backup.id,
                human_bytes(backup.size_bytes),
                human_bytes(backup.compressed_size)
            );
            for warning in &report.warnings {
                println!("  left out {warning}");
            }
        }
        Action::List(ListArgs { domain, since, json }) => {
            let since = since
                .map(|since| retention::parse_since(&since, Utc::now()))
                .transpose()?;
            let backups = engine.list(&ListFilter { domain, since })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else {
                print_table(&backups);
            }
        }
        Action::Verify { id } => {
            if !engine.verify(&id)? {
                return Err(CommandError::Corrupt(id));
            }
            println!("Backup {id} is intact");
        }
        Action::Restore { id, domain } => {
            let report = engine.restore(&id, domain.as_deref())?;
            println!(
                "Restored {} items of backup {}, {} failed",
                report.items_restored,
                report.id,
                report.failures.len()
            );
            for failure in &report.failures {
                println!("  failed {failure}");
            }
            if let Some(warning) = &report.reload_warning {
                println!("  reloading services failed: {warning}");
            }
        }
        Action::Delete { id } => {
            engine.delete(&id)?;
            println!("Deleted backup {id}");
        }
        Action::Export { id, dest } => {
            let target = engine.export(&id, &dest)?;
            println!("Exported backup {id} to {}", target.display());
        }
        Action::Import { src } => {
            let backup = engine.import(&src)?;
            println!("Imported {} as {} backup {}", src.display(), backup.backup_type, backup.id);
        }
        Action::Sweep { retention_days } => {
            let retention_days = match retention_days {
                Some(days) => days,
                None => scheduler
                    .policy()?
                    .map_or(DEFAULT_RETENTION_DAYS, |policy| policy.retention_days),
            };
            let deleted = engine.sweep(retention_days, Utc::now())?;
            println!("Deleted {} backups older than {retention_days} days", deleted.len());
            for id in deleted {
                println!("  {id}");
            }
        }
        Action::Schedule(action) => schedule(&scheduler, action)?,
    }

    Ok(())
}

fn schedule(scheduler: &Scheduler, action: ScheduleAction) -> Result<(), CommandError> {
    match action {
        ScheduleAction::Enable {
            time,
            backup_type,
            scope,
            retention_days,
            compression,
        } => {
            let policy = scheduler.enable(&time, backup_type, scope, retention_days, compression)?;
            println!(
                "Scheduled daily {} backups at {}, keeping {} days",
                policy.backup_type, policy.time, policy.retention_days
            );
        }
        ScheduleAction::Disable => {
            scheduler.disable()?;
            println!("Scheduled backups disabled");
        }
        ScheduleAction::Status => {
            let status = scheduler.status(Local::now())?;
            match (&status.policy, status.next_run) {
                (Some(policy), Some(next_run)) if status.enabled => println!(
                    "Enabled: daily {} backups at {}, keeping {} days, next run {}",
                    policy.backup_type,
                    policy.time,
                    policy.retention_days,
                    next_run.format("%Y-%m-%d %H:%M")
                ),
                _ => println!("Disabled"),
            }
        }
    }
    Ok(())
}

fn print_table(backups: &[Backup]) {
    if backups.is_empty() {
        println!("No backups");
        return;
    }

    println!(
        "{:<20} {:<20} {:<9} {:<30} {:>10} {:>10}",
        "ID", "TIMESTAMP", "TYPE", "SCOPE", "SIZE", "ARCHIVE"
    );
    for backup in backups {
        println!(
            "{:<20} {:<20} {:<9} {:<30} {:>10} {:>10}",
            backup.id,
            backup.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            backup.backup_type.to_string(),
            backup.scope,
            human_bytes(backup.size_bytes),
            human_bytes(backup.compressed_size)
        );
    }
}
