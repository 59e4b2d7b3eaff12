use std::fs;
use std::io;
use std::path::PathBuf;

use serde_json::Value;

use super::{Certificate, Host, HostError};
use crate::backends::DbEngine;
use crate::config::{DatabaseConfig, EngineConfig};
use crate::util::process::{Invocation, ProcessRunner};

const MYSQL_SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];
const POSTGRES_SYSTEM_DATABASES: &[&str] = &["postgres"];

/// The machine the engine runs on.
///
/// Domains are read from `<state_dir>/domains.json`, databases are listed
/// with the engines' clients and services are reloaded using `systemctl`.
#[derive(Debug, Clone)]
pub struct LocalHost<R> {
    runner: R,
    state_dir: PathBuf,
    letsencrypt: PathBuf,
    ssl: PathBuf,
    database: DatabaseConfig,
    services: Vec<String>,
}

impl<R: ProcessRunner> LocalHost<R> {
    pub fn new(runner: R, config: &EngineConfig) -> Self {
        Self {
            runner,
            state_dir: config.state_dir.clone(),
            letsencrypt: config.paths.letsencrypt.clone(),
            ssl: config.paths.ssl.clone(),
            database: config.database.clone(),
            services: config.services.reload.clone(),
        }
    }

    fn is_active(&self, service: &str) -> bool {
        let invocation = Invocation::new("systemctl").args(["is-active", "--quiet", service]);
        self.runner.run(&invocation).is_ok()
    }
}

/// Extracts domain names from the contents of `domains.json`.
///
/// Accepts an array of names, an array of objects carrying a `domain` or
/// `name` field, or an object with such an array under `domains`.
fn parse_domains(value: &Value) -> Vec<String> {
    let entries: &[Value] = match value {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("domains") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    let mut domains: Vec<String> = entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(name.as_str()),
            Value::Object(map) => map
                .get("domain")
                .or_else(|| map.get("name"))
                .and_then(Value::as_str),
            _ => None,
        })
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    domains.sort();
    domains.dedup();
    domains
}

impl<R: ProcessRunner> Host for LocalHost<R> {
    fn list_domains(&self) -> Result<Vec<String>, HostError> {
        let path = self.state_dir.join("domains.json");
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(target: "host", "{} doesn't exist, no domains hosted", path.display());
                return Ok(Vec::new());
            }
            Err(source) => return Err(HostError::Read { path, source }),
        };

        let value: Value =
            serde_json::from_str(&contents).map_err(|source| HostError::Parse {
                path: path.clone(),
                source,
            })?;
        Ok(parse_domains(&value))
    }

    fn list_databases(&self, engine: DbEngine) -> Result<Vec<String>, HostError> {
        let (invocation, system) = match engine {
            DbEngine::Mysql => (
                Invocation::new("mysql")
                    .args(self.database.client_args(engine))
                    .args(["-N", "-B", "-e", "SHOW DATABASES"]),
                MYSQL_SYSTEM_SCHEMAS,
            ),
            DbEngine::Postgresql => (
                Invocation::new("psql")
                    .args(self.database.client_args(engine))
                    .args([
                        "--no-align",
                        "--tuples-only",
                        "--dbname=postgres",
                        "--command",
                        "SELECT datname FROM pg_database WHERE NOT datistemplate",
                    ]),
                POSTGRES_SYSTEM_DATABASES,
            ),
        };

        let output = self
            .runner
            .run(&invocation.timeout(self.database.timeout()))?;
        let databases = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !system.contains(name))
            .map(String::from)
            .collect();
        Ok(databases)
    }

    fn reload_services(&self) -> Result<(), HostError> {
        let mut failures = Vec::new();
        for service in &self.services {
            if !self.is_active(service) {
                log::debug!(target: "host", "Not reloading inactive service {service}");
                continue;
            }

            let invocation = Invocation::new("systemctl").args(["reload", service.as_str()]);
            match self.runner.run(&invocation) {
                Ok(_) => log::info!(target: "host", "Reloaded {service}"),
                Err(e) => {
                    log::warn!(target: "host", "Reloading {service} failed: {e}");
                    failures.push((service.clone(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HostError::Reload(failures))
        }
    }

    fn locate_certificate(&self, domain: &str) -> Option<Certificate> {
        let live = self.letsencrypt.join("live").join(domain);
        let candidates = [
            Certificate {
                cert: live.join("fullchain.pem"),
                key: live.join("privkey.pem"),
            },
            Certificate {
                cert: self.ssl.join(format!("{domain}.crt")),
                key: self.ssl.join(format!("{domain}.key")),
            },
        ];

        candidates
            .into_iter()
            .find(|candidate| candidate.cert.is_file())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::Path;

    use super::*;
    use crate::util::process::{Captured, ProcessError};

    #[derive(Default)]
    struct Replies {
        stdout: &'static str,
        inactive: Vec<&'static str>,
        broken: Vec<&'static str>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl ProcessRunner for Replies {
        fn run(&self, invocation: &Invocation) -> Result<Captured, ProcessError> {
            self.calls.borrow_mut().push(invocation.args.clone());
            if invocation.args.first().map(String::as_str) == Some("is-active")
                && self.inactive.contains(&invocation.args[2].as_str())
            {
                return Err(ProcessError::Failed {
                    program: invocation.program.clone(),
                    code: Some(3),
                    stderr: String::new(),
                });
            }
            if invocation.args.first().map(String::as_str) == Some("reload")
                && self.broken.contains(&invocation.args[1].as_str())
            {
                return Err(ProcessError::Failed {
                    program: invocation.program.clone(),
                    code: Some(1),
                    stderr: "Job for service failed".to_string(),
                });
            }
            Ok(Captured {
                stdout: self.stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    fn host(runner: Replies, state_dir: &Path) -> LocalHost<Replies> {
        let config = EngineConfig {
            state_dir: state_dir.to_path_buf(),
            ..Default::default()
        };
        LocalHost::new(runner, &config)
    }

    #[test]
    fn parses_domain_lists() {
        let names: Value = serde_json::from_str(r#"["b.example", "a.example", "b.example"]"#).unwrap();
        assert_eq!(parse_domains(&names), ["a.example", "b.example"]);

        let objects: Value =
            serde_json::from_str(r#"[{"domain": "a.example"}, {"name": "c.example"}, {"php": "8.2"}]"#)
                .unwrap();
        assert_eq!(parse_domains(&objects), ["a.example", "c.example"]);

        let wrapped: Value = serde_json::from_str(r#"{"domains": ["a.example"]}"#).unwrap();
        assert_eq!(parse_domains(&wrapped), ["a.example"]);
    }

    #[test]
    fn missing_domains_file_means_no_domains() {
        let state = tempfile::tempdir().unwrap();
        let host = host(Replies::default(), state.path());
        assert!(host.list_domains().unwrap().is_empty());
    }

    #[test]
    fn malformed_domains_file_is_an_error() {
        let state = tempfile::tempdir().unwrap();
        fs::write(state.path().join("domains.json"), "[").unwrap();
        let host = host(Replies::default(), state.path());
        assert!(matches!(host.list_domains(), Err(HostError::Parse { .. })));
    }

    #[test]
    fn filters_system_schemas() {
        let state = tempfile::tempdir().unwrap();
        let runner = Replies {
            stdout: "information_schema\nmysql\nshop\nperformance_schema\nsys\nblog\n",
            ..Default::default()
        };
        let host = host(runner, state.path());
        assert_eq!(host.list_databases(DbEngine::Mysql).unwrap(), ["shop", "blog"]);
    }

    #[test]
    fn reloads_active_services_only() {
        let state = tempfile::tempdir().unwrap();
        let runner = Replies {
            inactive: vec!["apache2"],
            ..Default::default()
        };
        let host = host(runner, state.path());
        host.reload_services().unwrap();

        let calls = host.runner.calls.borrow();
        let reloads: Vec<_> = calls
            .iter()
            .filter(|args| args[0] == "reload")
            .map(|args| args[1].as_str())
            .collect();
        assert_eq!(reloads, ["nginx", "php-fpm"]);
    }

    #[test]
    fn failing_reload_does_not_stop_later_services() {
        let state = tempfile::tempdir().unwrap();
        let runner = Replies {
            broken: vec!["nginx"],
            ..Default::default()
        };
        let host = host(runner, state.path());

        let Err(HostError::Reload(failures)) = host.reload_services() else {
            panic!("expected reload failure");
        };
        let failed: Vec<_> = failures.iter().map(|(service, _)| service.as_str()).collect();
        assert_eq!(failed, ["nginx"]);

        let calls = host.runner.calls.borrow();
        let reloads: Vec<_> = calls
            .iter()
            .filter(|args| args[0] == "reload")
            .map(|args| args[1].as_str())
            .collect();
        assert_eq!(reloads, ["nginx", "apache2", "php-fpm"]);
    }
}
