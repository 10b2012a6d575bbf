// In crates/protections/src/lib.rs

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use core_types::{IntentKey, IntentRole, OrderStatus, Position, Symbol, TradeIntent};
use execution::ProtectionSupport;
use ledger::{ReserveMeta, TradeLedger};
use router::ExecutionRouter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod error;
pub mod store;

pub use error::{Error, Result};

/// Who is responsible for triggering the exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProtectionMode {
    /// The venue holds the protective orders; we only track their ids so
    /// they can be cancelled during unwind.
    Native {
        stop_order_id: Option<String>,
        take_profit_order_id: Option<String>,
    },
    /// We watch the position ourselves and market-close on breach.
    Synthetic,
}

/// Desired and actual protective state for one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionState {
    pub symbol: Symbol,
    pub broker: String,
    pub mode: ProtectionMode,
    /// Signed position quantity at arming time.
    pub quantity: Decimal,
    pub stop_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// The signal decision that opened the position; protective exit keys
    /// derive from it, so retries stay idempotent.
    pub signal_id: String,
    pub last_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl ProtectionState {
    /// Breach check against a fresh price. Returns the protective role
    /// that fired, if any.
    fn breached(&self, price: Decimal) -> Option<IntentRole> {
        let long = self.quantity > Decimal::ZERO;
        if let Some(stop) = self.stop_price {
            let hit = if long { price <= stop } else { price >= stop };
            if hit {
                return Some(IntentRole::StopLoss);
            }
        }
        if let Some(tp) = self.take_profit_price {
            let hit = if long { price >= tp } else { price <= tp };
            if hit {
                return Some(IntentRole::TakeProfit);
            }
        }
        None
    }
}

/// Tracks stop-loss/take-profit guarantees for every open position and
/// keeps them alive across restarts via a durable JSON snapshot.
///
/// Invariant: exactly one entry per protected position. When the mode is
/// `Synthetic`, this manager — not the broker — is responsible for the
/// exit, and a breached-but-unclosed stop is treated as a fatal-risk
/// condition: the close is retried every cycle and logged as critical
/// until it lands.
pub struct ProtectionsManager {
    entries: HashMap<Symbol, ProtectionState>,
    path: PathBuf,
}

impl ProtectionsManager {
    /// Loads the snapshot from `path`, or starts empty when absent.
    pub fn load(path: PathBuf) -> Self {
        let entries: HashMap<Symbol, ProtectionState> = store::read_json_or_default(&path);
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Restored protections from snapshot.");
        }
        Self { entries, path }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&ProtectionState> {
        self.entries.get(symbol)
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.keys().cloned().collect()
    }

    fn persist(&self) -> Result<()> {
        store::atomic_write_json(&self.path, &self.entries)?;
        Ok(())
    }

    /// Removes the entry for a position that was closed through the
    /// normal signal path, cancelling native legs first.
    pub async fn drop_for(&mut self, router: &ExecutionRouter, symbol: &Symbol) -> Result<()> {
        if let Some(entry) = self.entries.remove(symbol) {
            self.cancel_native_legs(router, &entry).await;
            self.persist()?;
        }
        Ok(())
    }

    /// Arms protection for an open position: native orders when the venue
    /// supports them, a synthetic watch otherwise. Native legs are
    /// reserved in the ledger before anything is sent.
    pub async fn ensure(
        &mut self,
        router: &ExecutionRouter,
        ledger: &TradeLedger,
        position: &Position,
        signal_id: &str,
        stop_price: Option<Decimal>,
        take_profit_price: Option<Decimal>,
    ) -> Result<()> {
        if stop_price.is_none() && take_profit_price.is_none() {
            return Ok(());
        }

        let symbol = &position.symbol;
        let broker = &position.broker;
        let quantity = position.quantity.abs();

        let mut mode = ProtectionMode::Synthetic;

        if router.supports_protections(symbol)? {
            let stop_key = stop_price
                .map(|_| IntentKey::derive(broker, symbol, IntentRole::StopLoss, signal_id));
            let tp_key = take_profit_price
                .map(|_| IntentKey::derive(broker, symbol, IntentRole::TakeProfit, signal_id));

            for (key, role) in [
                (stop_key.as_ref(), IntentRole::StopLoss),
                (tp_key.as_ref(), IntentRole::TakeProfit),
            ] {
                if let Some(key) = key {
                    ledger.reserve(
                        key,
                        ReserveMeta {
                            broker,
                            symbol,
                            role,
                            side: position.closing_side(),
                            detail: json!({"qty": quantity.to_string(), "signal_id": signal_id}),
                        },
                    )?;
                }
            }

            match router
                .set_protection(
                    symbol,
                    quantity,
                    stop_price,
                    take_profit_price,
                    stop_key.as_ref(),
                    tp_key.as_ref(),
                )
                .await
            {
                Ok(ProtectionSupport::Native { stop_order_id, take_profit_order_id }) => {
                    if let (Some(key), Some(order_id)) = (stop_key.as_ref(), stop_order_id.as_ref()) {
                        ledger.mark_submitted(key, order_id, json!({"sl": stop_price.map(|p| p.to_string())}))?;
                    }
                    if let (Some(key), Some(order_id)) = (tp_key.as_ref(), take_profit_order_id.as_ref()) {
                        ledger.mark_submitted(key, order_id, json!({"tp": take_profit_price.map(|p| p.to_string())}))?;
                    }
                    tracing::info!(
                        symbol = %symbol,
                        broker = %broker,
                        stop = ?stop_price,
                        take_profit = ?take_profit_price,
                        "Native protections placed."
                    );
                    mode = ProtectionMode::Native { stop_order_id, take_profit_order_id };
                }
                Ok(ProtectionSupport::Unsupported) | Err(_) => {
                    // Free the reserved legs so the synthetic trigger can
                    // re-use the same keys later.
                    for key in [stop_key.as_ref(), tp_key.as_ref()].into_iter().flatten() {
                        ledger.record_outcome(
                            key,
                            OrderStatus::Cancelled,
                            json!({"reason": "native_protection_unavailable"}),
                        )?;
                    }
                    tracing::warn!(
                        symbol = %symbol,
                        broker = %broker,
                        "Native protections unavailable. Falling back to synthetic watch."
                    );
                }
            }
        }

        if mode == ProtectionMode::Synthetic {
            tracing::info!(
                symbol = %symbol,
                broker = %broker,
                stop = ?stop_price,
                take_profit = ?take_profit_price,
                "Synthetic protections armed."
            );
        }

        self.entries.insert(
            symbol.clone(),
            ProtectionState {
                symbol: symbol.clone(),
                broker: broker.clone(),
                mode,
                quantity: position.quantity,
                stop_price,
                take_profit_price,
                signal_id: signal_id.to_string(),
                last_price: None,
                created_at: Utc::now(),
            },
        );
        self.persist()
    }

    /// Per-cycle reconciliation, ordered before new-intent evaluation so
    /// existing risk is capped before new risk is taken.
    ///
    /// Drops entries whose position is gone (native leg fired, or closed
    /// externally); for synthetic entries compares the current price to
    /// stop/target and issues exactly one market close per breach through
    /// the router, gated by a ledger reservation.
    pub async fn reconcile(
        &mut self,
        router: &ExecutionRouter,
        ledger: &TradeLedger,
    ) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }

        let positions = router.positions(None).await;
        let by_symbol: HashMap<&Symbol, &Position> =
            positions.iter().map(|p| (&p.symbol, p)).collect();

        let mut to_remove: Vec<Symbol> = Vec::new();
        let mut dirty = false;

        let symbols: Vec<Symbol> = self.entries.keys().cloned().collect();
        for symbol in symbols {
            let Some(entry) = self.entries.get(&symbol).cloned() else {
                continue;
            };

            // Position gone: the protective order fired while we were not
            // looking, or the position was closed externally.
            let Some(position) = by_symbol.get(&symbol) else {
                tracing::info!(symbol = %symbol, "Position closed; dropping its protection entry.");
                to_remove.push(symbol);
                continue;
            };

            if matches!(entry.mode, ProtectionMode::Native { .. }) {
                // The venue owns the trigger; nothing to watch here.
                continue;
            }

            let price = match router.current_price(&symbol).await {
                Ok(price) => price,
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "No price for synthetic watch; retrying next cycle.");
                    continue;
                }
            };

            let breach = entry.breached(price);
            if let Some(live) = self.entries.get_mut(&symbol) {
                live.last_price = Some(price);
            }
            dirty = true;

            let Some(role) = breach else {
                continue;
            };

            let quantity = position.quantity.abs();
            let side = position.closing_side();
            let key = IntentKey::derive(&entry.broker, &symbol, role, &entry.signal_id);

            let reserved = ledger.reserve(
                &key,
                ReserveMeta {
                    broker: &entry.broker,
                    symbol: &symbol,
                    role,
                    side,
                    detail: json!({
                        "reason": role.as_str(),
                        "qty": quantity.to_string(),
                        "trigger_price": price.to_string(),
                    }),
                },
            )?;
            if !reserved {
                // An exit under this key is already in flight (or done);
                // the position-gone check will clear the entry once the
                // venue confirms.
                continue;
            }

            let intent = TradeIntent {
                symbol: symbol.clone(),
                side,
                quantity,
                stop_price: None,
                take_profit_price: None,
                role,
                profile: "protections".to_string(),
                signal_id: entry.signal_id.clone(),
                key: key.clone(),
            };

            match router.place_order(&intent).await {
                Ok(result) => {
                    ledger.mark_submitted(&key, &result.order_id, json!({"qty": quantity.to_string()}))?;
                    if result.status.is_terminal() {
                        ledger.record_outcome(
                            &key,
                            result.status,
                            json!({"price": result.price.to_string()}),
                        )?;
                    }
                    if result.status == OrderStatus::Filled {
                        tracing::warn!(
                            symbol = %symbol,
                            role = role.as_str(),
                            price = %result.price,
                            "Synthetic protection fired; position closed."
                        );
                        to_remove.push(symbol.clone());
                    } else {
                        tracing::warn!(
                            symbol = %symbol,
                            role = role.as_str(),
                            status = result.status.as_str(),
                            "Protective exit not yet final; awaiting reconciliation."
                        );
                    }
                }
                Err(e) => {
                    // Free the key for the retry and keep the watch armed.
                    let status = match &e {
                        router::Error::Broker(execution::Error::Rejected { .. }) => OrderStatus::Rejected,
                        _ => OrderStatus::Cancelled,
                    };
                    ledger.record_outcome(&key, status, json!({"error": e.to_string()}))?;
                    tracing::error!(
                        symbol = %symbol,
                        broker = %entry.broker,
                        key = %key,
                        error = %e,
                        "CRITICAL: breached synthetic stop could not be closed; will retry next cycle."
                    );
                }
            }
        }

        for symbol in &to_remove {
            self.entries.remove(symbol);
            dirty = true;
        }
        if dirty {
            self.persist()?;
        }
        Ok(())
    }

    async fn cancel_native_legs(&self, router: &ExecutionRouter, entry: &ProtectionState) {
        let ProtectionMode::Native { stop_order_id, take_profit_order_id } = &entry.mode else {
            return;
        };
        for order_id in [stop_order_id, take_profit_order_id].into_iter().flatten() {
            if let Err(e) = router.cancel_protection(&entry.symbol, order_id).await {
                tracing::warn!(
                    symbol = %entry.symbol,
                    order_id = %order_id,
                    error = %e,
                    "Failed to cancel native protective order."
                );
            }
        }
    }

    /// Kill-switch unwind: cancels every native protective order and
    /// clears all synthetic watches. The empty set is persisted so a
    /// restart cannot resurrect stale protections.
    pub async fn cancel_all(&mut self, router: &ExecutionRouter) -> Result<()> {
        let entries: Vec<ProtectionState> = self.entries.values().cloned().collect();
        for entry in &entries {
            self.cancel_native_legs(router, entry).await;
        }
        self.entries.clear();
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_config::types::SimulatedSettings;
    use execution::simulated::SimulatedBroker;
    use execution::BrokerAdapter;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn sym(s: &str) -> Symbol {
        Symbol(s.to_string())
    }

    async fn setup(dir: &std::path::Path) -> (ProtectionsManager, ExecutionRouter, Arc<SimulatedBroker>, TradeLedger) {
        let sim = Arc::new(SimulatedBroker::new(
            SimulatedSettings {
                starting_cash: 10_000.0,
                slippage_percent: 0.0,
                taker_fee: 0.0,
            },
            None,
        ));
        let router = ExecutionRouter::new(StdHashMap::new(), "sim", Duration::from_secs(1))
            .with_broker(sim.clone());
        let manager = ProtectionsManager::load(dir.join("protections.json"));
        let ledger = TradeLedger::in_memory().unwrap();
        (manager, router, sim, ledger)
    }

    async fn open_long(sim: &SimulatedBroker, symbol: &Symbol, qty: Decimal, price: Decimal) -> Position {
        sim.set_mark(symbol, price).await;
        sim.place_order(&execution::OrderRequest {
            symbol: symbol.clone(),
            side: core_types::Side::Buy,
            quantity: qty,
            price: None,
            client_key: None,
        })
        .await
        .unwrap();
        Position {
            symbol: symbol.clone(),
            broker: "sim".to_string(),
            quantity: qty,
            avg_entry_price: price,
            unrealized_pnl: dec!(0),
        }
    }

    #[tokio::test]
    async fn unsupported_venue_arms_synthetic_watch() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, router, sim, ledger) = setup(dir.path()).await;
        let symbol = sym("BTCUSDT");
        let position = open_long(&sim, &symbol, dec!(1), dec!(100)).await;

        manager
            .ensure(&router, &ledger, &position, "sig-1", Some(dec!(90)), Some(dec!(120)))
            .await
            .unwrap();

        let entry = manager.get(&symbol).unwrap();
        assert_eq!(entry.mode, ProtectionMode::Synthetic);
        assert_eq!(entry.stop_price, Some(dec!(90)));
    }

    #[tokio::test]
    async fn stop_breach_closes_exactly_once_and_clears_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, router, sim, ledger) = setup(dir.path()).await;
        let symbol = sym("BTCUSDT");
        let position = open_long(&sim, &symbol, dec!(1), dec!(100)).await;

        manager
            .ensure(&router, &ledger, &position, "sig-1", Some(dec!(90)), None)
            .await
            .unwrap();

        // Price crosses the stop.
        sim.set_mark(&symbol, dec!(85)).await;
        manager.reconcile(&router, &ledger).await.unwrap();

        assert!(manager.is_empty());
        assert!(router.positions(None).await.is_empty());

        // The exit is recorded under the deterministic key; a second
        // reconcile with the same conditions cannot close again.
        let key = IntentKey::derive("sim", &symbol, IntentRole::StopLoss, "sig-1");
        let record = ledger.get(&key).unwrap().unwrap();
        assert_eq!(record.status, OrderStatus::Filled);

        manager.reconcile(&router, &ledger).await.unwrap();
        assert!(router.positions(None).await.is_empty());
    }

    #[tokio::test]
    async fn take_profit_breach_closes_long() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, router, sim, ledger) = setup(dir.path()).await;
        let symbol = sym("ETHUSDT");
        let position = open_long(&sim, &symbol, dec!(2), dec!(100)).await;

        manager
            .ensure(&router, &ledger, &position, "sig-2", Some(dec!(90)), Some(dec!(110)))
            .await
            .unwrap();

        sim.set_mark(&symbol, dec!(115)).await;
        manager.reconcile(&router, &ledger).await.unwrap();

        assert!(manager.is_empty());
        let key = IntentKey::derive("sim", &symbol, IntentRole::TakeProfit, "sig-2");
        assert_eq!(ledger.get(&key).unwrap().unwrap().status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn untriggered_watch_stays_armed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, router, sim, ledger) = setup(dir.path()).await;
        let symbol = sym("BTCUSDT");
        let position = open_long(&sim, &symbol, dec!(1), dec!(100)).await;

        manager
            .ensure(&router, &ledger, &position, "sig-1", Some(dec!(90)), Some(dec!(120)))
            .await
            .unwrap();

        sim.set_mark(&symbol, dec!(100)).await;
        manager.reconcile(&router, &ledger).await.unwrap();

        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(&symbol).unwrap().last_price, Some(dec!(100)));
        assert_eq!(router.positions(None).await.len(), 1);
    }

    #[tokio::test]
    async fn externally_closed_position_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, router, sim, ledger) = setup(dir.path()).await;
        let symbol = sym("BTCUSDT");
        let position = open_long(&sim, &symbol, dec!(1), dec!(100)).await;

        manager
            .ensure(&router, &ledger, &position, "sig-1", Some(dec!(90)), None)
            .await
            .unwrap();

        // Someone closes the position behind our back.
        sim.close_position(&symbol).await.unwrap();
        manager.reconcile(&router, &ledger).await.unwrap();

        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, router, sim, ledger) = setup(dir.path()).await;
        let symbol = sym("BTCUSDT");
        let position = open_long(&sim, &symbol, dec!(1), dec!(100)).await;

        manager
            .ensure(&router, &ledger, &position, "sig-1", Some(dec!(90)), None)
            .await
            .unwrap();
        drop(manager);

        let reloaded = ProtectionsManager::load(dir.path().join("protections.json"));
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&symbol).unwrap().stop_price, Some(dec!(90)));
    }

    #[tokio::test]
    async fn cancel_all_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, router, sim, ledger) = setup(dir.path()).await;
        let a = open_long(&sim, &sym("BTCUSDT"), dec!(1), dec!(100)).await;
        let b = open_long(&sim, &sym("ETHUSDT"), dec!(1), dec!(50)).await;

        manager.ensure(&router, &ledger, &a, "sig-1", Some(dec!(90)), None).await.unwrap();
        manager.ensure(&router, &ledger, &b, "sig-2", Some(dec!(45)), None).await.unwrap();
        assert_eq!(manager.len(), 2);

        manager.cancel_all(&router).await.unwrap();
        assert!(manager.is_empty());

        // The persisted snapshot is empty too.
        let reloaded = ProtectionsManager::load(dir.path().join("protections.json"));
        assert!(reloaded.is_empty());
    }
}
