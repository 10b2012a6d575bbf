// In crates/execution/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Network-level failures that are worth retrying on the next cycle.
    /// The ledger is not touched for these.
    #[error("Transient network error: {0}")]
    Transient(String),

    /// The exchange understood the request and said no. Terminal for the
    /// intent; recorded in the ledger as `rejected`.
    #[error("Rejected by exchange: code {code}, msg: {reason}")]
    Rejected { code: String, reason: String },

    /// Credentials failed. Fatal for the adapter (it gets excluded from
    /// routing), never for the process.
    #[error("Authentication failed for broker '{broker}': {reason}")]
    Auth { broker: String, reason: String },

    /// The adapter has no implementation for this capability.
    #[error("Operation not supported by this adapter: {0}")]
    Unsupported(&'static str),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    /// Classifies a reqwest failure: auth-shaped HTTP statuses become
    /// `Auth`, everything else (timeouts, connect errors, 5xx) is
    /// retryable.
    pub fn from_http(broker: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Error::Auth {
                    broker: broker.to_string(),
                    reason: format!("HTTP {}", status),
                };
            }
        }
        Error::Transient(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
