//! Library to back up and restore the web stack of a single host.
//!
//! A backup is one compressed, checksummed archive holding the web roots of
//! the hosted domains, logical dumps of their databases, TLS material and the
//! web server and firewall configuration. Backups can be restored as a whole
//! or per domain.
//!
//! The different parts of a backup are implemented in the [`backends`] module,
//! the operations on backups in the [`engine`] module.

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod config;
pub mod engine;
pub mod host;
pub mod util;
