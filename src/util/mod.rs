//! Building blocks without knowledge of backups.

pub mod archive;
pub mod atomic;
pub mod checksum;
pub mod lock;
pub mod process;
pub mod retention;
