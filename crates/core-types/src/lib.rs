// In crates/core-types/src/lib.rs

pub mod error;
pub mod intent;
pub mod types;

// Re-export the most important types for easy access from other crates.
pub use error::{Error, Result};
pub use intent::{derive_signal_id, IntentKey};
pub use types::{
    ExecutionMode, IntentRole, OrderStatus, Position, Side, Symbol, TradeIntent,
};
