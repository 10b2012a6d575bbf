// In crates/router/src/error.rs

use core_types::Symbol;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No broker is configured for symbol {0}")]
    UnroutableSymbol(Symbol),

    #[error("Broker '{0}' is unhealthy and excluded from routing")]
    AdapterUnhealthy(String),

    #[error("Broker error: {0}")]
    Broker(#[from] execution::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
