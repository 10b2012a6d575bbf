// In crates/execution/src/simulated.rs

use std::collections::HashMap;
use std::path::PathBuf;

use app_config::types::SimulatedSettings;
use async_trait::async_trait;
use core_types::{IntentKey, OrderStatus, Position, Side, Symbol};
use num_traits::FromPrimitive;
use num_traits::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{AccountState, OrderRequest, OrderResult, ProtectionSupport};
use crate::BrokerAdapter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SimPosition {
    quantity: Decimal,
    avg_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimState {
    cash: Decimal,
    positions: HashMap<Symbol, SimPosition>,
    /// Last known mark prices. Fed by the runner's signal artifact and by
    /// tests; not persisted as authoritative market data.
    marks: HashMap<Symbol, Decimal>,
    order_seq: u64,
    /// Submission log, kept so reconciliation lookups behave like a real
    /// venue's order history.
    orders: Vec<OrderResult>,
}

/// An entirely in-process broker with the same contract as the live
/// adapters. Used for paper trading, for the live-arm downgrade path and
/// for tests. Fills are instant, with a configurable slippage and taker
/// fee; `set_protection` reports `Unsupported` so paper runs exercise the
/// synthetic protection path.
pub struct SimulatedBroker {
    name: String,
    settings: SimulatedSettings,
    state: Mutex<SimState>,
    state_file: Option<PathBuf>,
}

impl SimulatedBroker {
    /// Creates a simulated venue. When `state_file` is given the account
    /// survives process restarts (paper runs); tests usually pass `None`.
    pub fn new(settings: SimulatedSettings, state_file: Option<PathBuf>) -> Self {
        let starting_cash = Decimal::from_f64(settings.starting_cash).unwrap_or_default();
        let state = state_file
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|raw| serde_json::from_str::<SimState>(&raw).ok())
            .unwrap_or(SimState {
                cash: starting_cash,
                positions: HashMap::new(),
                marks: HashMap::new(),
                order_seq: 0,
                orders: Vec::new(),
            });

        Self {
            name: "sim".to_string(),
            settings,
            state: Mutex::new(state),
            state_file,
        }
    }

    /// Publishes a mark price. The runner calls this from the signal
    /// artifact each cycle so paper fills track the market.
    pub async fn set_mark(&self, symbol: &Symbol, price: Decimal) {
        let mut state = self.state.lock().await;
        state.marks.insert(symbol.clone(), price);
    }

    fn persist(&self, state: &SimState) {
        let Some(path) = &self.state_file else {
            return;
        };
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    tracing::warn!(error = %e, path = %path.display(), "Failed to persist sim state.");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize sim state."),
        }
    }

    fn slippage(&self) -> Decimal {
        Decimal::from_f64(self.settings.slippage_percent).unwrap_or_default()
    }

    fn taker_fee(&self) -> Decimal {
        Decimal::from_f64(self.settings.taker_fee).unwrap_or_default()
    }

    /// Applies a fill to the held position, returning realized PnL for
    /// any closed quantity.
    fn apply_fill(state: &mut SimState, symbol: &Symbol, side: Side, qty: Decimal, price: Decimal) -> Decimal {
        let entry = state.positions.entry(symbol.clone()).or_default();
        let signed = if side == Side::Buy { qty } else { -qty };
        let mut realized = Decimal::ZERO;

        if entry.quantity.is_zero() {
            entry.quantity = signed;
            entry.avg_price = price;
        } else if entry.quantity.signum() == signed.signum() {
            // Scaling in: volume-weighted average entry.
            let new_qty = entry.quantity + signed;
            entry.avg_price =
                (entry.avg_price * entry.quantity + price * signed) / new_qty;
            entry.quantity = new_qty;
        } else {
            // Closing (possibly flipping).
            let closing = entry.quantity.abs().min(signed.abs());
            realized = if entry.quantity > Decimal::ZERO {
                (price - entry.avg_price) * closing
            } else {
                (entry.avg_price - price) * closing
            };
            let new_qty = entry.quantity + signed;
            if new_qty.is_zero() {
                entry.quantity = Decimal::ZERO;
                entry.avg_price = Decimal::ZERO;
            } else {
                entry.quantity = new_qty;
                // Any flipped remainder carries the trade price.
                entry.avg_price = price;
            }
        }

        if entry.quantity.is_zero() {
            state.positions.remove(symbol);
        }
        realized
    }
}

#[async_trait]
impl BrokerAdapter for SimulatedBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        if order.quantity <= Decimal::ZERO {
            return Err(Error::Rejected {
                code: "sim-qty".to_string(),
                reason: "quantity must be > 0".to_string(),
            });
        }

        let mut state = self.state.lock().await;

        let fill_price = match order.price {
            Some(limit) => limit,
            None => {
                let mark = state.marks.get(&order.symbol).copied().ok_or_else(|| {
                    Error::Transient(format!("no mark price for {}", order.symbol))
                })?;
                // Market orders always fill on the wrong side of the book.
                match order.side {
                    Side::Buy => mark * (Decimal::ONE + self.slippage()),
                    Side::Sell => mark * (Decimal::ONE - self.slippage()),
                }
            }
        };

        let fee = order.quantity * fill_price * self.taker_fee();
        let realized = Self::apply_fill(&mut state, &order.symbol, order.side, order.quantity, fill_price);
        state.cash += realized - fee;

        state.order_seq += 1;
        let result = OrderResult {
            order_id: format!("sim-ord-{}", state.order_seq),
            client_key: order.client_key.as_ref().map(|k| k.as_str().to_string()),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: fill_price,
            status: OrderStatus::Filled,
            broker: self.name.clone(),
        };
        state.orders.push(result.clone());
        self.persist(&state);

        Ok(result)
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &Symbol) -> Result<()> {
        // Fills are instant, so there is never anything to cancel.
        Ok(())
    }

    async fn balance(&self) -> Result<AccountState> {
        let state = self.state.lock().await;
        let mut unrealized = Decimal::ZERO;
        for (symbol, pos) in &state.positions {
            let mark = state.marks.get(symbol).copied().unwrap_or(pos.avg_price);
            unrealized += if pos.quantity > Decimal::ZERO {
                (mark - pos.avg_price) * pos.quantity
            } else {
                (pos.avg_price - mark) * pos.quantity.abs()
            };
        }
        Ok(AccountState {
            broker: self.name.clone(),
            equity: state.cash + unrealized,
            balance: state.cash,
            currency: "USDT".to_string(),
        })
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(state.positions.len());
        for (symbol, pos) in &state.positions {
            let mark = state.marks.get(symbol).copied().unwrap_or(pos.avg_price);
            let unrealized = if pos.quantity > Decimal::ZERO {
                (mark - pos.avg_price) * pos.quantity
            } else {
                (pos.avg_price - mark) * pos.quantity.abs()
            };
            out.push(Position {
                symbol: symbol.clone(),
                broker: self.name.clone(),
                quantity: pos.quantity,
                avg_entry_price: pos.avg_price,
                unrealized_pnl: unrealized,
            });
        }
        Ok(out)
    }

    async fn open_orders(&self, _symbol: Option<&Symbol>) -> Result<Vec<OrderResult>> {
        Ok(Vec::new())
    }

    async fn current_price(&self, symbol: &Symbol) -> Result<Decimal> {
        let state = self.state.lock().await;
        state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::Transient(format!("no mark price for {}", symbol)))
    }

    async fn close_position(&self, symbol: &Symbol) -> Result<Option<OrderResult>> {
        let (qty, side) = {
            let state = self.state.lock().await;
            match state.positions.get(symbol) {
                Some(pos) if !pos.quantity.is_zero() => (
                    pos.quantity.abs(),
                    if pos.quantity > Decimal::ZERO { Side::Sell } else { Side::Buy },
                ),
                _ => return Ok(None),
            }
        };

        let order = OrderRequest {
            symbol: symbol.clone(),
            side,
            quantity: qty,
            price: None,
            client_key: None,
        };
        self.place_order(&order).await.map(Some)
    }

    async fn set_protection(
        &self,
        _symbol: &Symbol,
        _quantity: Decimal,
        _stop_price: Option<Decimal>,
        _take_profit_price: Option<Decimal>,
        _stop_key: Option<&IntentKey>,
        _take_profit_key: Option<&IntentKey>,
    ) -> Result<ProtectionSupport> {
        // The synthetic watch in the protections manager covers paper runs.
        Ok(ProtectionSupport::Unsupported)
    }

    async fn cancel_protection(&self, _order_id: &str, _symbol: &Symbol) -> Result<()> {
        Ok(())
    }

    async fn order_status(
        &self,
        order_id: Option<&str>,
        client_key: Option<&IntentKey>,
        _symbol: &Symbol,
    ) -> Result<Option<OrderResult>> {
        let state = self.state.lock().await;
        let found = state.orders.iter().rev().find(|o| {
            order_id.is_some_and(|id| o.order_id == id)
                || client_key.is_some_and(|k| o.client_key.as_deref() == Some(k.as_str()))
        });
        Ok(found.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::IntentRole;
    use rust_decimal_macros::dec;

    fn sym(s: &str) -> Symbol {
        Symbol(s.to_string())
    }

    fn broker() -> SimulatedBroker {
        let settings = SimulatedSettings {
            starting_cash: 10_000.0,
            slippage_percent: 0.0,
            taker_fee: 0.0,
        };
        SimulatedBroker::new(settings, None)
    }

    fn market(symbol: &str, side: Side, qty: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: sym(symbol),
            side,
            quantity: qty,
            price: None,
            client_key: None,
        }
    }

    #[tokio::test]
    async fn round_trip_realizes_pnl() {
        let broker = broker();
        broker.set_mark(&sym("BTCUSDT"), dec!(100)).await;
        broker.place_order(&market("BTCUSDT", Side::Buy, dec!(1))).await.unwrap();

        broker.set_mark(&sym("BTCUSDT"), dec!(110)).await;
        broker.place_order(&market("BTCUSDT", Side::Sell, dec!(1))).await.unwrap();

        let account = broker.balance().await.unwrap();
        assert_eq!(account.balance, dec!(10010));
        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scaling_in_averages_entry_price() {
        let broker = broker();
        broker.set_mark(&sym("ETHUSDT"), dec!(100)).await;
        broker.place_order(&market("ETHUSDT", Side::Buy, dec!(1))).await.unwrap();
        broker.set_mark(&sym("ETHUSDT"), dec!(200)).await;
        broker.place_order(&market("ETHUSDT", Side::Buy, dec!(1))).await.unwrap();

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(2));
        assert_eq!(positions[0].avg_entry_price, dec!(150));
    }

    #[tokio::test]
    async fn slippage_fills_on_the_wrong_side() {
        let settings = SimulatedSettings {
            starting_cash: 10_000.0,
            slippage_percent: 0.01,
            taker_fee: 0.0,
        };
        let broker = SimulatedBroker::new(settings, None);
        broker.set_mark(&sym("BTCUSDT"), dec!(100)).await;

        let fill = broker.place_order(&market("BTCUSDT", Side::Buy, dec!(1))).await.unwrap();
        assert_eq!(fill.price, dec!(101.00));
    }

    #[tokio::test]
    async fn close_position_flattens_and_reports_none_when_flat() {
        let broker = broker();
        broker.set_mark(&sym("BTCUSDT"), dec!(100)).await;
        broker.place_order(&market("BTCUSDT", Side::Buy, dec!(2))).await.unwrap();

        let closed = broker.close_position(&sym("BTCUSDT")).await.unwrap();
        assert!(closed.is_some());
        assert!(broker.positions().await.unwrap().is_empty());

        let again = broker.close_position(&sym("BTCUSDT")).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn protections_are_unsupported() {
        let broker = broker();
        let support = broker
            .set_protection(&sym("BTCUSDT"), dec!(1), Some(dec!(90)), None, None, None)
            .await
            .unwrap();
        assert!(matches!(support, ProtectionSupport::Unsupported));
    }

    #[tokio::test]
    async fn order_status_finds_by_client_key() {
        let broker = broker();
        broker.set_mark(&sym("BTCUSDT"), dec!(100)).await;
        let key = IntentKey::derive("sim", &sym("BTCUSDT"), IntentRole::Entry, "sig-1");
        let order = OrderRequest::market(sym("BTCUSDT"), Side::Buy, dec!(1), key.clone());
        broker.place_order(&order).await.unwrap();

        let looked_up = broker
            .order_status(None, Some(&key), &sym("BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(looked_up.unwrap().status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim_state.json");
        let settings = SimulatedSettings {
            starting_cash: 10_000.0,
            slippage_percent: 0.0,
            taker_fee: 0.0,
        };

        {
            let broker = SimulatedBroker::new(settings.clone(), Some(path.clone()));
            broker.set_mark(&sym("BTCUSDT"), dec!(100)).await;
            broker.place_order(&market("BTCUSDT", Side::Buy, dec!(1))).await.unwrap();
        }

        let reopened = SimulatedBroker::new(settings, Some(path));
        let positions = reopened.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(1));
    }
}
