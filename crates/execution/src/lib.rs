// In crates/execution/src/lib.rs

use async_trait::async_trait;
use core_types::{IntentKey, Position, Symbol};
use rust_decimal::Decimal;

pub mod bitra;
pub mod equitex;
pub mod error;
pub mod rate_limit;
pub mod simulated;
pub mod types;

// Re-export public types
pub use error::{Error, Result};
pub use types::{AccountState, OrderRequest, OrderResult, ProtectionSupport};

/// The universal capability surface over one brokerage connection.
///
/// An adapter owns the wire protocol for a single venue and nothing else:
/// no routing, no risk, no idempotency. Every call fails with one of the
/// taxonomy variants in [`Error`] so callers can tell retryable network
/// trouble from terminal rejections and dead credentials.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// The routing name of this adapter (e.g., "bitra", "equitex", "sim").
    fn name(&self) -> &str;

    /// Submits an order and returns the venue's view of it. Market orders
    /// may come back already `Filled` or still `Submitted`; the caller
    /// reconciles the latter.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult>;

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<()>;

    async fn balance(&self) -> Result<AccountState>;

    async fn positions(&self) -> Result<Vec<Position>>;

    async fn open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OrderResult>>;

    async fn current_price(&self, symbol: &Symbol) -> Result<Decimal>;

    /// Market-closes whatever is open for `symbol`. Returns `None` when
    /// there was nothing to close (already flat).
    async fn close_position(&self, symbol: &Symbol) -> Result<Option<OrderResult>>;

    /// Whether this venue can hold protective orders itself. Callers use
    /// this to decide if ledger reservations for the protective legs are
    /// needed before `set_protection` sends anything.
    fn supports_protections(&self) -> bool {
        false
    }

    /// Asks the venue to hold stop-loss / take-profit orders for an open
    /// position. Venues without native support return
    /// [`ProtectionSupport::Unsupported`]; the protections manager then
    /// watches the position in software.
    async fn set_protection(
        &self,
        symbol: &Symbol,
        quantity: Decimal,
        stop_price: Option<Decimal>,
        take_profit_price: Option<Decimal>,
        stop_key: Option<&IntentKey>,
        take_profit_key: Option<&IntentKey>,
    ) -> Result<ProtectionSupport>;

    /// Cancels one native protective order by its venue order id.
    async fn cancel_protection(&self, order_id: &str, symbol: &Symbol) -> Result<()>;

    /// Looks up an order by venue id or client key. Used by restart
    /// reconciliation to resolve stale reservations. `None` means the
    /// venue has no record of it.
    async fn order_status(
        &self,
        order_id: Option<&str>,
        client_key: Option<&IntentKey>,
        symbol: &Symbol,
    ) -> Result<Option<OrderResult>>;
}
