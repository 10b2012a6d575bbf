// In crates/ledger/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// An outcome was reported for a key that was never reserved. This is
    /// a bug in the caller, not a recoverable condition.
    #[error("No reservation exists for intent key {0}")]
    UnknownIntent(String),

    #[error("Ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
