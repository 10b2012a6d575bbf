// In crates/execution/src/types.rs

use core_types::{IntentKey, OrderStatus, Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A normalized order as handed to a broker adapter. The router derives
/// this from a `TradeIntent`; adapters never see intents directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// Limit price; `None` means a market order.
    pub price: Option<Decimal>,
    /// The caller-assigned idempotency key, forwarded to the venue as the
    /// client order id where supported.
    pub client_key: Option<IntentKey>,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: Side, quantity: Decimal, client_key: IntentKey) -> Self {
        Self {
            symbol,
            side,
            quantity,
            price: None,
            client_key: Some(client_key),
        }
    }
}

/// The adapter's view of an order after submission (or on lookup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_key: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// Average fill price; zero until the venue reports one.
    pub price: Decimal,
    pub status: OrderStatus,
    pub broker: String,
}

/// Aggregate account numbers for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub broker: String,
    /// Balance plus unrealized PnL.
    pub equity: Decimal,
    /// Realized cash balance.
    pub balance: Decimal,
    pub currency: String,
}

/// What an adapter reports back from `set_protection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtectionSupport {
    /// The venue holds the protective orders itself.
    Native {
        stop_order_id: Option<String>,
        take_profit_order_id: Option<String>,
    },
    /// No native support; the caller must watch the position in software.
    Unsupported,
}
