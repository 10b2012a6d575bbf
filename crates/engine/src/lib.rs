// In crates/engine/src/lib.rs

pub mod alerts;
pub mod heartbeat;
pub mod kill_switch;
pub mod reconciler;
pub mod risk;
pub mod signals;
pub mod state;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use app_config::RiskLimits;
use chrono::Utc;
use core_types::{
    derive_signal_id, ExecutionMode, IntentKey, IntentRole, OrderStatus, Position, Symbol,
    TradeIntent,
};
use execution::simulated::SimulatedBroker;
use ledger::{ReserveMeta, TradeLedger};
use num_traits::FromPrimitive;
use protections::ProtectionsManager;
use router::ExecutionRouter;
use rust_decimal::Decimal;
use serde_json::json;

use crate::alerts::Alerter;
use crate::heartbeat::Heartbeat;
use crate::kill_switch::{FileKillSwitch, KillSwitchSource};
use crate::risk::{DrawdownAnchors, RiskGate};
use crate::signals::{SignalArtifact, SignalRow, StrategyParams};
use crate::state::RunnerState;

/// Static configuration for one runner process. Risk limits are
/// deliberately NOT here: they are re-read from disk every cycle.
pub struct RunnerConfig {
    pub mode: ExecutionMode,
    /// Strategy/profile tag stamped on every intent.
    pub profile: String,
    pub signals_file: PathBuf,
    pub risk_file: PathBuf,
    pub runner_state_file: PathBuf,
    pub kill_switch_file: PathBuf,
    pub cycle_interval: Duration,
    pub max_consecutive_errors: u32,
    pub stale_open_after: chrono::Duration,
    /// Optional allowlist restricting which symbols are evaluated.
    pub assets: Option<Vec<String>>,
}

/// How a run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// One-shot mode finished its single cycle.
    Completed,
    /// The kill-switch (external or auto-tripped) forced an unwind. The
    /// process must be restarted after the flag is cleared.
    Halted { reason: String },
}

/// The production run-loop: polls signals, decides intents, dispatches
/// them exactly once through the router, and keeps ledger, protections,
/// heartbeat and kill-switch obligations alive.
///
/// Per cycle: load signals -> check kill-switch -> reconcile protections
/// -> evaluate intents -> submit -> heartbeat -> sleep. On kill-switch:
/// cancel protections -> liquidate everything -> halt.
pub struct Runner {
    config: RunnerConfig,
    live_router: Arc<ExecutionRouter>,
    paper_router: Arc<ExecutionRouter>,
    /// The simulated venue behind `paper_router`, fed mark prices from
    /// the signal artifact each cycle.
    paper_broker: Option<Arc<SimulatedBroker>>,
    ledger: Arc<TradeLedger>,
    protections: ProtectionsManager,
    kill_switch: Box<dyn KillSwitchSource>,
    heartbeat: Heartbeat,
    alerter: Alerter,
    state: RunnerState,
    anchors: DrawdownAnchors,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RunnerConfig,
        live_router: Arc<ExecutionRouter>,
        paper_router: Arc<ExecutionRouter>,
        paper_broker: Option<Arc<SimulatedBroker>>,
        ledger: Arc<TradeLedger>,
        protections: ProtectionsManager,
        kill_switch: Box<dyn KillSwitchSource>,
        heartbeat: Heartbeat,
        alerter: Alerter,
    ) -> Self {
        let state = RunnerState::load(&config.runner_state_file);
        Self {
            config,
            live_router,
            paper_router,
            paper_broker,
            ledger,
            protections,
            kill_switch,
            heartbeat,
            alerter,
            state,
            anchors: DrawdownAnchors::default(),
        }
    }

    /// The live-arm downgrade, re-checked every cycle: `live` mode with
    /// the arming flag off routes everything through the simulated path.
    fn active_router(&self, limits: &RiskLimits) -> Arc<ExecutionRouter> {
        match self.config.mode {
            ExecutionMode::Live if limits.live_trading_armed => Arc::clone(&self.live_router),
            ExecutionMode::Live => {
                tracing::warn!(
                    "Live mode without the arming flag: downgrading to paper semantics this cycle."
                );
                Arc::clone(&self.paper_router)
            }
            _ => Arc::clone(&self.paper_router),
        }
    }

    /// Startup reconciliation, run once before the first cycle: stale
    /// reservations are resolved against broker order history, orphaned
    /// protections dropped, unprotected positions alerted.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        let limits = app_config::load_risk_limits(&self.config.risk_file)
            .context("risk configuration unreadable at startup")?;
        let router = self.active_router(&limits);

        reconciler::resolve_stale_reservations(&router, &self.ledger, self.config.stale_open_after)
            .await?;
        self.protections.reconcile(&router, &self.ledger).await?;
        let unprotected = reconciler::warn_unprotected_positions(&router, &self.protections).await;
        if unprotected > 0 {
            self.alerter
                .send(&format!("{} open position(s) without protections", unprotected))
                .await;
        }
        Ok(())
    }

    /// Runs the loop. `once` executes a single cycle (the CLI's one-shot
    /// mode); otherwise cycles repeat on the configured interval until
    /// the kill-switch fires.
    pub async fn run(&mut self, once: bool) -> anyhow::Result<RunOutcome> {
        tracing::info!(
            mode = self.config.mode.as_str(),
            interval_s = self.config.cycle_interval.as_secs_f64(),
            max_errors = self.config.max_consecutive_errors,
            "Strategy runner starting."
        );
        let mut consecutive_errors: u32 = 0;

        loop {
            self.heartbeat.begin_cycle();
            self.heartbeat.touch("alive", "loop_top");

            // The kill-switch is polled exactly once per cycle, at the
            // top. Clearing the flag mid-unwind does not abort an
            // in-progress unwind.
            let switch = self.kill_switch.read();
            if switch.enabled {
                let reason = if switch.reason.is_empty() {
                    "manual".to_string()
                } else {
                    switch.reason.clone()
                };
                let epoch = switch.enabled_at.unwrap_or_else(|| reason.clone());
                self.unwind(&reason, &epoch).await;
                self.heartbeat.touch_now("stopped", "kill_switch_enabled");
                return Ok(RunOutcome::Halted { reason });
            }

            match self.run_cycle().await {
                Ok(()) => {
                    consecutive_errors = 0;
                    self.heartbeat.touch_now("ok", "cycle_ok");
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::error!(
                        error = %e,
                        consecutive_errors,
                        max = self.config.max_consecutive_errors,
                        "Cycle failed."
                    );
                    self.alerter
                        .send(&format!(
                            "Runner ERROR ({}/{}): {}",
                            consecutive_errors, self.config.max_consecutive_errors, e
                        ))
                        .await;
                    self.heartbeat
                        .touch_now("error", &format!("cycle_error:{}", consecutive_errors));

                    if consecutive_errors >= self.config.max_consecutive_errors {
                        // The one case where the core writes the switch
                        // itself: repeated failures mean undefined state,
                        // and the halt must survive a restart.
                        let reason =
                            format!("auto_max_consecutive_errors:{}", consecutive_errors);
                        let file_switch = FileKillSwitch::new(self.config.kill_switch_file.clone());
                        if let Err(write_err) = file_switch.trip(&reason) {
                            tracing::error!(error = %write_err, "Failed to persist auto kill-switch.");
                        }
                        self.unwind(&reason, &reason.clone()).await;
                        self.heartbeat.touch_now("stopped", "auto_kill_switch");
                        return Ok(RunOutcome::Halted { reason });
                    }
                }
            }

            if once {
                return Ok(RunOutcome::Completed);
            }
            self.heartbeat.touch("alive", "sleeping");
            tokio::time::sleep(self.config.cycle_interval).await;
        }
    }

    async fn run_cycle(&mut self) -> anyhow::Result<()> {
        // 1. Hot-reload the risk limits. A corrupt risk file is a cycle
        // error (it counts toward the auto-trip), never silently ignored.
        let limits = app_config::load_risk_limits(&self.config.risk_file)
            .context("risk limits unreadable")?;
        let router = self.active_router(&limits);

        // 2. Fresh signal artifact. Fail-soft: a missing or malformed
        // artifact skips the cycle, it never crashes the loop.
        let artifact = match SignalArtifact::load(&self.config.signals_file) {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::warn!(error = %e, "Signal artifact unavailable; skipping cycle.");
                return Ok(());
            }
        };

        // 3. Publish marks so the simulated venue tracks the market in
        // paper (and downgraded-live) runs.
        if let Some(sim) = &self.paper_broker {
            for (symbol, rows) in &artifact.signals {
                if let Some(row) = rows.last() {
                    if let Some(price) = Decimal::from_f64(row.close) {
                        if price > Decimal::ZERO {
                            sim.set_mark(&Symbol(symbol.clone()), price).await;
                        }
                    }
                }
            }
        }

        // 4. Cap existing risk before taking any new risk.
        self.protections.reconcile(&router, &self.ledger).await?;

        // 5. Cycle snapshot: account, drawdown anchors, positions.
        let account = router.account_state().await;
        self.anchors.roll(Utc::now().date_naive(), &account);
        let drawdown_breach = self.anchors.breached(&account, limits.max_daily_drawdown);
        if let Some(reason) = &drawdown_breach {
            tracing::error!(reason = %reason, "Daily drawdown limit breached. New entries are blocked.");
        }

        let positions = router.positions(None).await;
        let mut open_count = positions.len();
        let position_map: HashMap<String, Position> = positions
            .into_iter()
            .map(|p| (p.symbol.0.clone(), p))
            .collect();

        // 6. Evaluate one intent at most per symbol, isolating failures
        // so one symbol (or broker) never halts the rest.
        let mut symbols: Vec<&String> = artifact.signals.keys().collect();
        symbols.sort();

        let mut state_dirty = false;
        for symbol_name in symbols {
            if let Some(allow) = &self.config.assets {
                if !allow.contains(symbol_name) {
                    continue;
                }
            }
            let Some(row) = artifact.latest(symbol_name) else {
                continue;
            };
            let symbol = Symbol(symbol_name.clone());
            let signal_id = derive_signal_id(
                &symbol,
                &row.ts,
                &artifact.strategy_version,
                &format!("{:.6}", row.p_long),
                &format!("{:.6}", row.p_short),
            );
            if self.state.already_seen(symbol_name, &signal_id) {
                continue;
            }

            let outcome = self
                .process_signal(
                    &router,
                    &limits,
                    &artifact.params,
                    &symbol,
                    row,
                    &signal_id,
                    &position_map,
                    &mut open_count,
                    drawdown_breach.as_ref(),
                    account.equity,
                )
                .await;

            match outcome {
                Ok(()) => {
                    self.state.mark_seen(symbol_name, &signal_id);
                    state_dirty = true;
                }
                Err(e) => {
                    // Left unseen on purpose: the decision is retried next
                    // cycle, and the ledger gate keeps the retry safe.
                    tracing::error!(symbol = %symbol, error = %e, "Signal processing failed for symbol.");
                }
            }
        }

        if state_dirty {
            self.state.persist(&self.config.runner_state_file)?;
        }
        Ok(())
    }

    /// Derives zero or one intent from the signal and the actual
    /// position, and submits it. An intent exists only when the desired
    /// position differs from the actual one.
    #[allow(clippy::too_many_arguments)]
    async fn process_signal(
        &mut self,
        router: &Arc<ExecutionRouter>,
        limits: &RiskLimits,
        params: &StrategyParams,
        symbol: &Symbol,
        row: &SignalRow,
        signal_id: &str,
        positions: &HashMap<String, Position>,
        open_count: &mut usize,
        drawdown_breach: Option<&String>,
        equity: Decimal,
    ) -> anyhow::Result<()> {
        let threshold = limits.confidence_threshold;
        let position = positions.get(&symbol.0);
        let position_qty = position.map(|p| p.quantity).unwrap_or(Decimal::ZERO);

        if row.p_short > threshold && position_qty > Decimal::ZERO {
            if let Some(position) = position {
                self.submit_exit(router, symbol, position, signal_id).await?;
                *open_count = open_count.saturating_sub(1);
            }
            return Ok(());
        }

        if row.p_long > threshold && position_qty <= Decimal::ZERO {
            self.submit_entry(
                router,
                limits,
                params,
                symbol,
                row,
                signal_id,
                equity,
                open_count,
                drawdown_breach,
            )
            .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_entry(
        &mut self,
        router: &Arc<ExecutionRouter>,
        limits: &RiskLimits,
        params: &StrategyParams,
        symbol: &Symbol,
        row: &SignalRow,
        signal_id: &str,
        equity: Decimal,
        open_count: &mut usize,
        drawdown_breach: Option<&String>,
    ) -> anyhow::Result<()> {
        let broker_name = router.broker_name_for(symbol).to_string();
        let key = IntentKey::derive(&broker_name, symbol, IntentRole::Entry, signal_id);

        let Some(price) = Decimal::from_f64(row.close).filter(|p| *p > Decimal::ZERO) else {
            tracing::warn!(symbol = %symbol, "Signal row has no usable close price; skipping.");
            return Ok(());
        };

        let risk_fraction = risk::scaled_risk(
            row.p_long,
            limits.risk_per_trade,
            limits.max_risk_per_trade,
            limits.confidence_threshold,
        );
        let quantity = risk::position_size(
            equity,
            row.atr,
            risk_fraction,
            params.sl_mult,
            price,
            limits.max_position_notional,
        );
        if quantity <= Decimal::ZERO {
            tracing::info!(symbol = %symbol, "Position size rounded to zero; skipping entry.");
            return Ok(());
        }

        // The exactly-once gate. Reserving before the risk check means a
        // refusal is recorded under the same key the order would have
        // used.
        let reserved = self.ledger.reserve(
            &key,
            ReserveMeta {
                broker: &broker_name,
                symbol,
                role: IntentRole::Entry,
                side: core_types::Side::Buy,
                detail: json!({
                    "qty": quantity.to_string(),
                    "price": price.to_string(),
                    "p": row.p_long,
                    "signal_id": signal_id,
                }),
            },
        )?;
        if !reserved {
            tracing::info!(symbol = %symbol, key = %key, "Entry already handled; skipping.");
            return Ok(());
        }

        let gate = RiskGate {
            limits,
            open_positions: *open_count,
            drawdown_breach: drawdown_breach.cloned(),
        };
        if let Err(violation) = gate.check_entry(quantity * price) {
            self.ledger.record_outcome(
                &key,
                OrderStatus::Rejected,
                json!({"reason": "RiskLimitExceeded", "violation": violation}),
            )?;
            tracing::warn!(
                symbol = %symbol,
                broker = %broker_name,
                key = %key,
                violation = %violation,
                "Entry refused: RiskLimitExceeded."
            );
            return Ok(());
        }

        let atr = Decimal::from_f64(row.atr).unwrap_or_default();
        let stop_price = (atr > Decimal::ZERO)
            .then(|| price - atr * Decimal::from_f64(params.sl_mult).unwrap_or_default());
        let take_profit_price = (atr > Decimal::ZERO)
            .then(|| price + atr * Decimal::from_f64(params.tp_mult).unwrap_or_default());

        let intent = TradeIntent {
            symbol: symbol.clone(),
            side: core_types::Side::Buy,
            quantity,
            stop_price,
            take_profit_price,
            role: IntentRole::Entry,
            profile: self.config.profile.clone(),
            signal_id: signal_id.to_string(),
            key: key.clone(),
        };

        match router.place_order(&intent).await {
            Ok(result) => {
                self.ledger
                    .mark_submitted(&key, &result.order_id, json!({"qty": quantity.to_string()}))?;
                if result.status.is_terminal() {
                    self.ledger.record_outcome(
                        &key,
                        result.status,
                        json!({"price": result.price.to_string()}),
                    )?;
                }
                match result.status {
                    OrderStatus::Filled => {
                        *open_count += 1;
                        tracing::info!(
                            symbol = %symbol,
                            broker = %result.broker,
                            qty = %result.quantity,
                            price = %result.price,
                            p = row.p_long,
                            "Entry filled."
                        );
                        let opened = Position {
                            symbol: symbol.clone(),
                            broker: result.broker.clone(),
                            quantity,
                            avg_entry_price: result.price,
                            unrealized_pnl: Decimal::ZERO,
                        };
                        self.protections
                            .ensure(router, &self.ledger, &opened, signal_id, stop_price, take_profit_price)
                            .await?;
                    }
                    OrderStatus::Rejected | OrderStatus::Cancelled => {
                        tracing::warn!(
                            symbol = %symbol,
                            key = %key,
                            status = result.status.as_str(),
                            "Entry did not fill."
                        );
                    }
                    _ => {
                        // Still open at the venue after the confirmation
                        // window; the stale sweep resolves it.
                        tracing::info!(
                            symbol = %symbol,
                            key = %key,
                            "Entry awaiting confirmation; reconciliation will resolve it."
                        );
                    }
                }
            }
            Err(router::Error::Broker(execution::Error::Rejected { code, reason })) => {
                tracing::warn!(symbol = %symbol, key = %key, code = %code, reason = %reason, "Entry rejected by exchange.");
                self.ledger.record_outcome(
                    &key,
                    OrderStatus::Rejected,
                    json!({"code": code, "reason": reason}),
                )?;
            }
            Err(router::Error::Broker(execution::Error::Transient(msg))) => {
                // We cannot know whether the venue received the order, so
                // the reservation stays pending for the stale sweep.
                tracing::warn!(symbol = %symbol, key = %key, error = %msg, "Transient failure on entry; reconciliation will resolve the reservation.");
            }
            Err(e) => {
                self.ledger.record_outcome(
                    &key,
                    OrderStatus::Rejected,
                    json!({"reason": e.to_string()}),
                )?;
                tracing::error!(symbol = %symbol, key = %key, error = %e, "Entry failed.");
                self.alerter
                    .send(&format!("Entry failed for {}: {}", symbol, e))
                    .await;
            }
        }
        Ok(())
    }

    async fn submit_exit(
        &mut self,
        router: &Arc<ExecutionRouter>,
        symbol: &Symbol,
        position: &Position,
        signal_id: &str,
    ) -> anyhow::Result<()> {
        let broker_name = position.broker.clone();
        let key = IntentKey::derive(&broker_name, symbol, IntentRole::Exit, signal_id);
        let quantity = position.quantity.abs();

        let reserved = self.ledger.reserve(
            &key,
            ReserveMeta {
                broker: &broker_name,
                symbol,
                role: IntentRole::Exit,
                side: position.closing_side(),
                detail: json!({"qty": quantity.to_string(), "signal_id": signal_id}),
            },
        )?;
        if !reserved {
            tracing::info!(symbol = %symbol, key = %key, "Exit already handled; skipping.");
            return Ok(());
        }

        let intent = TradeIntent {
            symbol: symbol.clone(),
            side: position.closing_side(),
            quantity,
            stop_price: None,
            take_profit_price: None,
            role: IntentRole::Exit,
            profile: self.config.profile.clone(),
            signal_id: signal_id.to_string(),
            key: key.clone(),
        };

        match router.place_order(&intent).await {
            Ok(result) => {
                self.ledger
                    .mark_submitted(&key, &result.order_id, json!({"qty": quantity.to_string()}))?;
                if result.status.is_terminal() {
                    self.ledger.record_outcome(
                        &key,
                        result.status,
                        json!({"price": result.price.to_string()}),
                    )?;
                }
                if result.status == OrderStatus::Filled {
                    tracing::info!(
                        symbol = %symbol,
                        qty = %quantity,
                        price = %result.price,
                        "Exit filled."
                    );
                    self.protections.drop_for(router, symbol).await?;
                } else {
                    tracing::warn!(
                        symbol = %symbol,
                        status = result.status.as_str(),
                        "Exit not final; reconciliation will resolve it."
                    );
                }
            }
            Err(router::Error::Broker(execution::Error::Rejected { code, reason })) => {
                tracing::warn!(symbol = %symbol, key = %key, code = %code, reason = %reason, "Exit rejected by exchange.");
                self.ledger.record_outcome(
                    &key,
                    OrderStatus::Rejected,
                    json!({"code": code, "reason": reason}),
                )?;
            }
            Err(router::Error::Broker(execution::Error::Transient(msg))) => {
                tracing::warn!(symbol = %symbol, key = %key, error = %msg, "Transient failure on exit; reconciliation will resolve the reservation.");
            }
            Err(e) => {
                self.ledger.record_outcome(
                    &key,
                    OrderStatus::Rejected,
                    json!({"reason": e.to_string()}),
                )?;
                tracing::error!(symbol = %symbol, key = %key, error = %e, "Exit failed.");
                self.alerter.send(&format!("Exit failed for {}: {}", symbol, e)).await;
            }
        }
        Ok(())
    }

    /// The kill-switch emergency sequence: cancel protections, liquidate
    /// every position, clear in-memory state. Closes are gated by ledger
    /// reservations keyed on the kill epoch, so a retried unwind never
    /// double-sells; `close_all_positions` then sweeps any stragglers
    /// (flattening an already-flat symbol is a no-op at the venue).
    async fn unwind(&mut self, reason: &str, epoch: &str) {
        tracing::warn!(reason, "KILL-SWITCH unwind starting.");
        self.alerter.send(&format!("KILL-SWITCH: {}", reason)).await;

        let limits = app_config::load_risk_limits(&self.config.risk_file).unwrap_or_default();
        let router = self.active_router(&limits);

        if let Err(e) = self.protections.cancel_all(&router).await {
            tracing::error!(error = %e, "Failed to cancel protections during unwind.");
        }

        let kill_signal_id = format!("kill-{}", epoch);
        for position in router.positions(None).await {
            let key = IntentKey::derive(
                &position.broker,
                &position.symbol,
                IntentRole::KillClose,
                &kill_signal_id,
            );
            let reserved = self.ledger.reserve(
                &key,
                ReserveMeta {
                    broker: &position.broker,
                    symbol: &position.symbol,
                    role: IntentRole::KillClose,
                    side: position.closing_side(),
                    detail: json!({"reason": reason, "qty": position.quantity.abs().to_string()}),
                },
            );
            match reserved {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(symbol = %position.symbol, "Kill-close already attempted; sweep will verify.");
                    continue;
                }
                Err(e) => {
                    tracing::error!(symbol = %position.symbol, error = %e, "Ledger failure during unwind; the sweep will close this position.");
                    continue;
                }
            }

            let intent = TradeIntent {
                symbol: position.symbol.clone(),
                side: position.closing_side(),
                quantity: position.quantity.abs(),
                stop_price: None,
                take_profit_price: None,
                role: IntentRole::KillClose,
                profile: self.config.profile.clone(),
                signal_id: kill_signal_id.clone(),
                key: key.clone(),
            };
            match router.place_order(&intent).await {
                Ok(result) => {
                    let _ = self.ledger.mark_submitted(
                        &key,
                        &result.order_id,
                        json!({"qty": intent.quantity.to_string()}),
                    );
                    if result.status.is_terminal() {
                        let _ = self.ledger.record_outcome(
                            &key,
                            result.status,
                            json!({"price": result.price.to_string()}),
                        );
                    }
                }
                Err(e) => {
                    let _ = self.ledger.record_outcome(
                        &key,
                        OrderStatus::Cancelled,
                        json!({"error": e.to_string()}),
                    );
                    tracing::error!(symbol = %position.symbol, error = %e, "Kill-close failed; sweep will retry.");
                }
            }
        }

        // The sweep: cancels resting orders everywhere and market-closes
        // whatever is still open, per-position failures reported.
        let outcomes = router.close_all_positions(reason).await;
        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        if failed > 0 {
            tracing::error!(failed, total = outcomes.len(), "Unwind left positions open.");
            self.alerter
                .send(&format!("Unwind incomplete: {}/{} closes failed", failed, outcomes.len()))
                .await;
        } else {
            tracing::warn!(total = outcomes.len(), "Unwind complete. All positions closed.");
        }
    }

    /// Test and status introspection.
    pub fn protections(&self) -> &ProtectionsManager {
        &self.protections
    }
}
