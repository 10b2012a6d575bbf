// In crates/core-types/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown side: {0}")]
    InvalidSide(String),

    #[error("unknown execution mode: {0}")]
    InvalidMode(String),

    #[error("unknown order status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, Error>;
