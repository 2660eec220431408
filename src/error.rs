//! Error types for the tiered store

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered store
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error, fatal to store construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// Element encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Index file could not be parsed or failed its consistency check
    #[error("Corrupt index file {path}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    /// Reading an element back from the data file failed
    #[error("Disk read failed for key {key}: {reason}")]
    DiskRead { key: String, reason: String },

    /// Writing an element to the data file failed
    #[error("Disk write failed for key {key}: {reason}")]
    DiskWrite { key: String, reason: String },

    /// Operation attempted after dispose()
    #[error("Store {0} has been disposed")]
    Disposed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(io) => Error::Io(io),
            other => Error::Serialization(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(format!("invalid JSON configuration: {}", e))
    }
}

impl Error {
    /// True for failures that mean the stored bytes are unusable rather than unreachable
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Serialization(_) | Error::CorruptIndex { .. })
    }
}
