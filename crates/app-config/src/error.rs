// In crates/app-config/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(#[from] config::ConfigError),

    #[error("Failed to read configuration file: {0}")]
    ReadFailed(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    ParseFailed(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
