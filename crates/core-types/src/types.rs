// In crates/core-types/src/types.rs

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::intent::IntentKey;

/// A tradable instrument identifier (e.g., "BTCUSDT", "SBER").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that flattens a position opened with `self`.
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(Error::InvalidSide(other.to_string())),
        }
    }
}

/// The effective execution regime for a run.
///
/// `Live` places real orders only when the live-arming flag in the risk
/// configuration is also on; otherwise each cycle downgrades to `Paper`
/// semantics and routes through the simulated adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Backtest,
    Paper,
    Live,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Backtest => "backtest",
            ExecutionMode::Paper => "paper",
            ExecutionMode::Live => "live",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backtest" => Ok(ExecutionMode::Backtest),
            "paper" => Ok(ExecutionMode::Paper),
            "live" => Ok(ExecutionMode::Live),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Lifecycle of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// A "live" record blocks re-reservation of its idempotency key.
    /// Rejected and cancelled intents may be retried under the same key.
    pub fn blocks_reservation(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::Filled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "submitted" => Ok(OrderStatus::Submitted),
            "filled" => Ok(OrderStatus::Filled),
            "rejected" => Ok(OrderStatus::Rejected),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

/// Why an intent exists. Folded into the idempotency key so that the
/// entry, exit and protective legs of one signal never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentRole {
    Entry,
    Exit,
    StopLoss,
    TakeProfit,
    PanicExit,
    KillClose,
}

impl IntentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentRole::Entry => "entry",
            IntentRole::Exit => "exit",
            IntentRole::StopLoss => "sl",
            IntentRole::TakeProfit => "tp",
            IntentRole::PanicExit => "panic-exit",
            IntentRole::KillClose => "kill-close",
        }
    }
}

/// A proposed action derived from a signal. Ephemeral: constructed,
/// submitted through the router, then discarded. The durable trace lives
/// in the ledger under `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub stop_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub role: IntentRole,
    /// Strategy/profile tag, recorded for audit.
    pub profile: String,
    /// The signal decision this intent was derived from.
    pub signal_id: String,
    pub key: IntentKey,
}

/// Broker-reported open exposure. A snapshot — the broker is always the
/// authority; callers re-query for freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub broker: String,
    /// Signed quantity: positive long, negative short.
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Position {
    pub fn is_open(&self) -> bool {
        !self.quantity.is_zero()
    }

    /// The market side that flattens this position.
    pub fn closing_side(&self) -> Side {
        if self.quantity > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_reservation_blocking() {
        assert!(OrderStatus::Pending.blocks_reservation());
        assert!(OrderStatus::Submitted.blocks_reservation());
        assert!(OrderStatus::Filled.blocks_reservation());
        assert!(!OrderStatus::Rejected.blocks_reservation());
        assert!(!OrderStatus::Cancelled.blocks_reservation());
    }

    #[test]
    fn closing_side_mirrors_exposure() {
        let long = Position {
            symbol: Symbol("BTCUSDT".to_string()),
            broker: "bitra".to_string(),
            quantity: dec!(0.5),
            avg_entry_price: dec!(65000),
            unrealized_pnl: dec!(0),
        };
        assert_eq!(long.closing_side(), Side::Sell);

        let short = Position { quantity: dec!(-0.5), ..long };
        assert_eq!(short.closing_side(), Side::Buy);
        assert!(short.is_open());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("LIVE".parse::<ExecutionMode>().unwrap(), ExecutionMode::Live);
        assert!("yolo".parse::<ExecutionMode>().is_err());
    }
}
