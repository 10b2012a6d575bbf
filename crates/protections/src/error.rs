// In crates/protections/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to persist protections snapshot: {0}")]
    Persist(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::Error),

    #[error("Router error: {0}")]
    Router(#[from] router::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
