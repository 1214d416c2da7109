//! Backup payload handling.

pub mod envelope;

pub use envelope::{decode, encode, BackupEnvelope};
