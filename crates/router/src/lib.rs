// In crates/router/src/lib.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use core_types::{IntentKey, Position, Symbol, TradeIntent};
use execution::{
    AccountState, BrokerAdapter, OrderRequest, OrderResult, ProtectionSupport,
};
use futures::future;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::sleep;

pub mod error;

pub use error::{Error, Result};

/// How often the confirmation loop polls an order that has not yet
/// reached a final status.
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One registered venue: the adapter plus the per-broker serialization
/// gate and health flag.
///
/// Every network-bound call against a venue goes through `gate`, so two
/// concurrent operations on the *same* broker never interleave (rate
/// limits, order-id races), while operations on distinct brokers run in
/// parallel freely.
struct BrokerHandle {
    name: String,
    adapter: Arc<dyn BrokerAdapter>,
    gate: Mutex<()>,
    healthy: AtomicBool,
}

impl BrokerHandle {
    fn mark_unhealthy(&self, reason: &str) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            tracing::error!(
                broker = %self.name,
                reason,
                "Adapter authentication failed. Excluding broker from routing until restart."
            );
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Aggregate account numbers across every healthy venue.
#[derive(Debug, Clone)]
pub struct GlobalAccountState {
    pub equity: Decimal,
    pub balance: Decimal,
    pub details: HashMap<String, AccountState>,
}

/// The outcome of one position-close attempt during bulk liquidation.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub symbol: Symbol,
    pub broker: String,
    pub error: Option<String>,
}

impl CloseOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The execution router: the single choke point between the run-loop and
/// the broker adapters.
///
/// It owns the symbol -> broker routing table, serializes calls per
/// broker, fans out across brokers concurrently, and tracks adapter
/// health. The run-loop never touches an adapter directly.
pub struct ExecutionRouter {
    handles: HashMap<String, Arc<BrokerHandle>>,
    routing: HashMap<String, String>,
    default_broker: String,
    confirm_timeout: Duration,
}

impl ExecutionRouter {
    pub fn new(
        routing: HashMap<String, String>,
        default_broker: impl Into<String>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            handles: HashMap::new(),
            routing,
            default_broker: default_broker.into(),
            confirm_timeout,
        }
    }

    /// Registers an adapter under its routing name.
    pub fn with_broker(mut self, adapter: Arc<dyn BrokerAdapter>) -> Self {
        let name = adapter.name().to_string();
        self.handles.insert(
            name.clone(),
            Arc::new(BrokerHandle {
                name,
                adapter,
                gate: Mutex::new(()),
                healthy: AtomicBool::new(true),
            }),
        );
        self
    }

    /// The routing-table name for a symbol (before health checks).
    pub fn broker_name_for(&self, symbol: &Symbol) -> &str {
        self.routing
            .get(&symbol.0)
            .map(String::as_str)
            .unwrap_or(&self.default_broker)
    }

    fn resolve(&self, symbol: &Symbol) -> Result<Arc<BrokerHandle>> {
        let name = self.broker_name_for(symbol);
        let handle = self
            .handles
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnroutableSymbol(symbol.clone()))?;
        if !handle.is_healthy() {
            return Err(Error::AdapterUnhealthy(handle.name.clone()));
        }
        Ok(handle)
    }

    /// True when the named broker is registered and healthy.
    pub fn is_broker_healthy(&self, name: &str) -> bool {
        self.handles.get(name).is_some_and(|h| h.is_healthy())
    }

    fn note_error(handle: &BrokerHandle, err: &execution::Error) {
        if err.is_auth() {
            handle.mark_unhealthy(&err.to_string());
        }
    }

    /// Places an order derived from a trade intent and waits (bounded) for
    /// a final status. This is the only path through which orders leave
    /// the process.
    pub async fn place_order(&self, intent: &TradeIntent) -> Result<OrderResult> {
        let handle = self.resolve(&intent.symbol)?;
        let request = OrderRequest::market(
            intent.symbol.clone(),
            intent.side,
            intent.quantity,
            intent.key.clone(),
        );

        let _gate = handle.gate.lock().await;
        let submitted = handle.adapter.place_order(&request).await.map_err(|e| {
            Self::note_error(&handle, &e);
            Error::Broker(e)
        })?;

        self.confirm(&handle, submitted).await
    }

    /// Polls the venue until the order reaches a terminal status or the
    /// confirmation window closes. Returns the last observed state — a
    /// still-`Submitted` result is handed to reconciliation, never lost.
    async fn confirm(&self, handle: &Arc<BrokerHandle>, order: OrderResult) -> Result<OrderResult> {
        if order.status.is_terminal() {
            return Ok(order);
        }

        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        let mut last = order;
        let key = last.client_key.clone().map(IntentKey::from_raw);

        while tokio::time::Instant::now() < deadline {
            sleep(CONFIRM_POLL_INTERVAL).await;
            match handle
                .adapter
                .order_status(Some(&last.order_id), key.as_ref(), &last.symbol)
                .await
            {
                Ok(Some(current)) => {
                    if current.status.is_terminal() {
                        return Ok(current);
                    }
                    last = current;
                }
                Ok(None) => {}
                Err(e) => {
                    Self::note_error(handle, &e);
                    tracing::warn!(
                        broker = %handle.name,
                        order_id = %last.order_id,
                        error = %e,
                        "Order confirmation poll failed."
                    );
                    if e.is_auth() {
                        break;
                    }
                }
            }
        }
        Ok(last)
    }

    /// Last traded price for a symbol, through the routed adapter.
    pub async fn current_price(&self, symbol: &Symbol) -> Result<Decimal> {
        let handle = self.resolve(symbol)?;
        let _gate = handle.gate.lock().await;
        handle.adapter.current_price(symbol).await.map_err(|e| {
            Self::note_error(&handle, &e);
            Error::Broker(e)
        })
    }

    /// Aggregated open positions across all (healthy) venues. A snapshot:
    /// callers re-query for freshness. Per-broker failures are logged and
    /// skipped, never short-circuited.
    pub async fn positions(&self, broker: Option<&str>) -> Vec<Position> {
        let tasks = self.handles.values().filter(|h| {
            broker.is_none_or(|b| h.name == b) && h.is_healthy()
        });

        let futures = tasks.map(|handle| {
            let handle = Arc::clone(handle);
            async move {
                let _gate = handle.gate.lock().await;
                match handle.adapter.positions().await {
                    Ok(positions) => positions,
                    Err(e) => {
                        Self::note_error(&handle, &e);
                        tracing::warn!(broker = %handle.name, error = %e, "Failed to list positions.");
                        Vec::new()
                    }
                }
            }
        });

        future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .filter(|p| p.is_open())
            .collect()
    }

    /// Aggregated open orders across all (healthy) venues.
    pub async fn open_orders(&self, broker: Option<&str>) -> Vec<OrderResult> {
        let tasks = self.handles.values().filter(|h| {
            broker.is_none_or(|b| h.name == b) && h.is_healthy()
        });

        let futures = tasks.map(|handle| {
            let handle = Arc::clone(handle);
            async move {
                let _gate = handle.gate.lock().await;
                match handle.adapter.open_orders(None).await {
                    Ok(orders) => orders,
                    Err(e) => {
                        Self::note_error(&handle, &e);
                        tracing::warn!(broker = %handle.name, error = %e, "Failed to list open orders.");
                        Vec::new()
                    }
                }
            }
        });

        future::join_all(futures).await.into_iter().flatten().collect()
    }

    /// Aggregated equity/balance across venues, for the drawdown guard.
    pub async fn account_state(&self) -> GlobalAccountState {
        let futures = self.handles.values().filter(|h| h.is_healthy()).map(|handle| {
            let handle = Arc::clone(handle);
            async move {
                let _gate = handle.gate.lock().await;
                match handle.adapter.balance().await {
                    Ok(state) => Some((handle.name.clone(), state)),
                    Err(e) => {
                        Self::note_error(&handle, &e);
                        tracing::warn!(broker = %handle.name, error = %e, "Failed to fetch account state.");
                        None
                    }
                }
            }
        });

        let mut details = HashMap::new();
        let mut equity = Decimal::ZERO;
        let mut balance = Decimal::ZERO;
        for entry in future::join_all(futures).await.into_iter().flatten() {
            equity += entry.1.equity;
            balance += entry.1.balance;
            details.insert(entry.0, entry.1);
        }
        GlobalAccountState { equity, balance, details }
    }

    /// Whether the venue routing `symbol` can hold protective orders
    /// natively.
    pub fn supports_protections(&self, symbol: &Symbol) -> Result<bool> {
        Ok(self.resolve(symbol)?.adapter.supports_protections())
    }

    /// Delegates protection placement to the routed adapter.
    pub async fn set_protection(
        &self,
        symbol: &Symbol,
        quantity: Decimal,
        stop_price: Option<Decimal>,
        take_profit_price: Option<Decimal>,
        stop_key: Option<&IntentKey>,
        take_profit_key: Option<&IntentKey>,
    ) -> Result<ProtectionSupport> {
        let handle = self.resolve(symbol)?;
        let _gate = handle.gate.lock().await;
        handle
            .adapter
            .set_protection(symbol, quantity, stop_price, take_profit_price, stop_key, take_profit_key)
            .await
            .map_err(|e| {
                Self::note_error(&handle, &e);
                Error::Broker(e)
            })
    }

    /// Cancels one native protective order.
    pub async fn cancel_protection(&self, symbol: &Symbol, order_id: &str) -> Result<()> {
        let handle = self.resolve(symbol)?;
        let _gate = handle.gate.lock().await;
        handle
            .adapter
            .cancel_protection(order_id, symbol)
            .await
            .map_err(|e| {
                Self::note_error(&handle, &e);
                Error::Broker(e)
            })
    }

    /// Looks up an order on the venue that routes `symbol`. Used by
    /// restart reconciliation.
    pub async fn order_status(
        &self,
        symbol: &Symbol,
        order_id: Option<&str>,
        client_key: Option<&IntentKey>,
    ) -> Result<Option<OrderResult>> {
        let handle = self.resolve(symbol)?;
        let _gate = handle.gate.lock().await;
        handle
            .adapter
            .order_status(order_id, client_key, symbol)
            .await
            .map_err(|e| {
                Self::note_error(&handle, &e);
                Error::Broker(e)
            })
    }

    /// Kill-switch liquidation: cancels outstanding orders, then
    /// market-closes every open position on every venue. One broker's
    /// failure never prevents attempts on the others; the caller gets a
    /// per-position outcome list.
    pub async fn close_all_positions(&self, reason: &str) -> Vec<CloseOutcome> {
        tracing::warn!(reason, "Closing ALL positions across every broker.");

        // Cancel whatever is resting first so fills cannot race the closes.
        let cancel_futures = self.handles.values().map(|handle| {
            let handle = Arc::clone(handle);
            async move {
                if !handle.is_healthy() {
                    return;
                }
                let _gate = handle.gate.lock().await;
                let orders = match handle.adapter.open_orders(None).await {
                    Ok(orders) => orders,
                    Err(e) => {
                        Self::note_error(&handle, &e);
                        tracing::warn!(broker = %handle.name, error = %e, "Failed to list orders for cancellation.");
                        return;
                    }
                };
                for order in orders {
                    if let Err(e) = handle.adapter.cancel_order(&order.order_id, &order.symbol).await {
                        Self::note_error(&handle, &e);
                        tracing::warn!(
                            broker = %handle.name,
                            order_id = %order.order_id,
                            error = %e,
                            "Failed to cancel order during liquidation."
                        );
                    }
                }
            }
        });
        future::join_all(cancel_futures).await;

        // Group open positions by broker, then close each broker's book
        // concurrently with the others (serially within one broker).
        let positions = self.positions(None).await;
        let mut by_broker: HashMap<String, Vec<Position>> = HashMap::new();
        for position in positions {
            by_broker.entry(position.broker.clone()).or_default().push(position);
        }

        let close_futures = by_broker.into_iter().map(|(broker, positions)| {
            let handle = self.handles.get(&broker).cloned();
            async move {
                let mut outcomes = Vec::with_capacity(positions.len());
                let Some(handle) = handle else {
                    for p in positions {
                        outcomes.push(CloseOutcome {
                            symbol: p.symbol,
                            broker: broker.clone(),
                            error: Some("broker not registered".to_string()),
                        });
                    }
                    return outcomes;
                };

                let _gate = handle.gate.lock().await;
                for position in positions {
                    let result = handle.adapter.close_position(&position.symbol).await;
                    let error = match result {
                        Ok(_) => None,
                        Err(e) => {
                            Self::note_error(&handle, &e);
                            Some(e.to_string())
                        }
                    };
                    if let Some(err) = &error {
                        tracing::error!(
                            broker = %handle.name,
                            symbol = %position.symbol,
                            error = %err,
                            "Failed to close position during liquidation."
                        );
                    } else {
                        tracing::info!(broker = %handle.name, symbol = %position.symbol, "Position closed.");
                    }
                    outcomes.push(CloseOutcome {
                        symbol: position.symbol,
                        broker: handle.name.clone(),
                        error,
                    });
                }
                outcomes
            }
        });

        future::join_all(close_futures).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_config::types::SimulatedSettings;
    use async_trait::async_trait;
    use core_types::{IntentRole, Side};
    use execution::simulated::SimulatedBroker;
    use rust_decimal_macros::dec;

    fn sym(s: &str) -> Symbol {
        Symbol(s.to_string())
    }

    fn sim(starting_cash: f64) -> SimulatedBroker {
        SimulatedBroker::new(
            SimulatedSettings {
                starting_cash,
                slippage_percent: 0.0,
                taker_fee: 0.0,
            },
            None,
        )
    }

    /// An adapter whose every call dies with an auth failure.
    struct DeadAuthAdapter {
        name: String,
    }

    #[async_trait]
    impl BrokerAdapter for DeadAuthAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn place_order(&self, _order: &OrderRequest) -> execution::Result<OrderResult> {
            Err(self.auth())
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &Symbol) -> execution::Result<()> {
            Err(self.auth())
        }

        async fn balance(&self) -> execution::Result<AccountState> {
            Err(self.auth())
        }

        async fn positions(&self) -> execution::Result<Vec<Position>> {
            Err(self.auth())
        }

        async fn open_orders(&self, _symbol: Option<&Symbol>) -> execution::Result<Vec<OrderResult>> {
            Err(self.auth())
        }

        async fn current_price(&self, _symbol: &Symbol) -> execution::Result<Decimal> {
            Err(self.auth())
        }

        async fn close_position(&self, _symbol: &Symbol) -> execution::Result<Option<OrderResult>> {
            Err(self.auth())
        }

        async fn set_protection(
            &self,
            _symbol: &Symbol,
            _quantity: Decimal,
            _stop_price: Option<Decimal>,
            _take_profit_price: Option<Decimal>,
            _stop_key: Option<&IntentKey>,
            _take_profit_key: Option<&IntentKey>,
        ) -> execution::Result<ProtectionSupport> {
            Err(self.auth())
        }

        async fn cancel_protection(&self, _order_id: &str, _symbol: &Symbol) -> execution::Result<()> {
            Err(self.auth())
        }

        async fn order_status(
            &self,
            _order_id: Option<&str>,
            _client_key: Option<&IntentKey>,
            _symbol: &Symbol,
        ) -> execution::Result<Option<OrderResult>> {
            Err(self.auth())
        }
    }

    impl DeadAuthAdapter {
        fn auth(&self) -> execution::Error {
            execution::Error::Auth {
                broker: self.name.clone(),
                reason: "invalid key".to_string(),
            }
        }
    }

    fn intent(symbol: &str, side: Side, qty: Decimal) -> TradeIntent {
        let symbol = sym(symbol);
        let key = IntentKey::derive("sim", &symbol, IntentRole::Entry, "sig-1");
        TradeIntent {
            symbol,
            side,
            quantity: qty,
            stop_price: None,
            take_profit_price: None,
            role: IntentRole::Entry,
            profile: "test".to_string(),
            signal_id: "sig-1".to_string(),
            key,
        }
    }

    fn router_with_sim() -> (ExecutionRouter, Arc<SimulatedBroker>) {
        let sim = Arc::new(sim(10_000.0));
        let router = ExecutionRouter::new(HashMap::new(), "sim", Duration::from_secs(1))
            .with_broker(sim.clone());
        (router, sim)
    }

    #[tokio::test]
    async fn orders_route_through_the_default_broker() {
        let (router, sim) = router_with_sim();
        sim.set_mark(&sym("BTCUSDT"), dec!(100)).await;

        let result = router.place_order(&intent("BTCUSDT", Side::Buy, dec!(1))).await.unwrap();
        assert_eq!(result.broker, "sim");
        assert_eq!(result.status, core_types::OrderStatus::Filled);

        let positions = router.positions(None).await;
        assert_eq!(positions.len(), 1);
    }

    #[tokio::test]
    async fn unroutable_symbol_is_an_error() {
        let sim = Arc::new(sim(10_000.0));
        let router = ExecutionRouter::new(HashMap::new(), "missing", Duration::from_secs(1))
            .with_broker(sim);
        let err = router.place_order(&intent("BTCUSDT", Side::Buy, dec!(1))).await.unwrap_err();
        assert!(matches!(err, Error::UnroutableSymbol(_)));
    }

    #[tokio::test]
    async fn auth_failure_marks_adapter_unhealthy() {
        let mut routing = HashMap::new();
        routing.insert("BTCUSDT".to_string(), "dead".to_string());
        let router = ExecutionRouter::new(routing, "sim", Duration::from_secs(1))
            .with_broker(Arc::new(sim(10_000.0)))
            .with_broker(Arc::new(DeadAuthAdapter { name: "dead".to_string() }));

        let err = router.place_order(&intent("BTCUSDT", Side::Buy, dec!(1))).await.unwrap_err();
        assert!(matches!(err, Error::Broker(execution::Error::Auth { .. })));
        assert!(!router.is_broker_healthy("dead"));

        // Subsequent routing to the dead adapter is refused outright.
        let err = router.place_order(&intent("BTCUSDT", Side::Buy, dec!(1))).await.unwrap_err();
        assert!(matches!(err, Error::AdapterUnhealthy(_)));
    }

    #[tokio::test]
    async fn close_all_still_reaches_healthy_brokers_when_one_is_dead() {
        let mut routing = HashMap::new();
        routing.insert("AAPL".to_string(), "dead".to_string());
        let sim = Arc::new(sim(10_000.0));
        let router = ExecutionRouter::new(routing, "sim", Duration::from_secs(1))
            .with_broker(sim.clone())
            .with_broker(Arc::new(DeadAuthAdapter { name: "dead".to_string() }));

        sim.set_mark(&sym("BTCUSDT"), dec!(100)).await;
        sim.set_mark(&sym("ETHUSDT"), dec!(50)).await;
        router.place_order(&intent("BTCUSDT", Side::Buy, dec!(1))).await.unwrap();
        router.place_order(&intent("ETHUSDT", Side::Buy, dec!(2))).await.unwrap();

        // Poison the dead adapter's health through a failing call first.
        let _ = router.current_price(&sym("AAPL")).await;

        let outcomes = router.close_all_positions("test-unwind").await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(CloseOutcome::is_ok));
        assert!(router.positions(None).await.is_empty());
    }

    #[tokio::test]
    async fn account_state_aggregates_across_brokers() {
        let (router, _sim) = router_with_sim();
        let state = router.account_state().await;
        assert_eq!(state.balance, dec!(10000));
        assert_eq!(state.details.len(), 1);
    }
}
