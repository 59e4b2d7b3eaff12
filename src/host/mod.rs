//! Interaction with the web stack of the host.
//!
//! The engine only asks the host which domains and databases exist, where a
//! domain's certificate lives and to reload its services after a restore.

mod local;

use std::io;
use std::path::PathBuf;

use derive_more::{Display, Error, From};

pub use local::LocalHost;

use crate::backends::DbEngine;
use crate::util::process::ProcessError;

/// Location of a domain's certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Display, Error, From)]
/// Errors on querying or controlling the host.
pub enum HostError {
    #[display("Reading {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[display("Parsing {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// Services that failed to reload, with the reason of each.
    #[display("Reloading failed: {}", describe_reload_failures(_0))]
    Reload(#[error(ignore)] Vec<(String, ProcessError)>),
    #[from]
    Process(ProcessError),
}

fn describe_reload_failures(failures: &[(String, ProcessError)]) -> String {
    failures
        .iter()
        .map(|(service, e)| format!("{service}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The collaborators of the engine on the host.
pub trait Host {
    /// Domains currently hosted, sorted and without duplicates.
    fn list_domains(&self) -> Result<Vec<String>, HostError>;

    /// Databases of `engine`, excluding the engine's system schemas.
    ///
    /// Fails if the engine is not installed or not reachable.
    fn list_databases(&self, engine: DbEngine) -> Result<Vec<String>, HostError>;

    /// Reloads the web stack's services.
    ///
    /// Every service is tried, failures are reported together.
    fn reload_services(&self) -> Result<(), HostError>;

    /// Certificate of `domain`, if the host has one.
    fn locate_certificate(&self, domain: &str) -> Option<Certificate>;
}

impl<H: Host + ?Sized> Host for &H {
    fn list_domains(&self) -> Result<Vec<String>, HostError> {
        (**self).list_domains()
    }

    fn list_databases(&self, engine: DbEngine) -> Result<Vec<String>, HostError> {
        (**self).list_databases(engine)
    }

    fn reload_services(&self) -> Result<(), HostError> {
        (**self).reload_services()
    }

    fn locate_certificate(&self, domain: &str) -> Option<Certificate> {
        (**self).locate_certificate(domain)
    }
}
