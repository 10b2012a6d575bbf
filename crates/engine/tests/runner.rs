//! End-to-end tests for the run-loop against the simulated venue: the
//! idempotency, risk-gating, live-arm downgrade and kill-switch unwind
//! guarantees.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use app_config::types::{AlertSettings, SimulatedSettings};
use core_types::{derive_signal_id, ExecutionMode, IntentKey, IntentRole, OrderStatus, Symbol};
use engine::alerts::Alerter;
use engine::heartbeat::Heartbeat;
use engine::kill_switch::{KillSwitchSource, KillSwitchState};
use engine::{RunOutcome, Runner, RunnerConfig};
use execution::simulated::SimulatedBroker;
use execution::BrokerAdapter;
use ledger::TradeLedger;
use protections::ProtectionsManager;
use router::ExecutionRouter;
use rust_decimal_macros::dec;

/// In-memory kill switch, flipped from tests.
#[derive(Clone, Default)]
struct TestSwitch(Arc<Mutex<KillSwitchState>>);

impl TestSwitch {
    fn enable(&self, reason: &str) {
        let mut state = self.0.lock().unwrap();
        state.enabled = true;
        state.reason = reason.to_string();
    }
}

impl KillSwitchSource for TestSwitch {
    fn read(&self) -> KillSwitchState {
        self.0.lock().unwrap().clone()
    }
}

struct Harness {
    runner: Runner,
    paper: Arc<SimulatedBroker>,
    live: Arc<SimulatedBroker>,
    ledger: Arc<TradeLedger>,
    switch: TestSwitch,
}

fn sim() -> Arc<SimulatedBroker> {
    Arc::new(SimulatedBroker::new(
        SimulatedSettings {
            starting_cash: 10_000.0,
            slippage_percent: 0.0,
            taker_fee: 0.0,
        },
        None,
    ))
}

fn write_artifact(dir: &Path, rows: &[(&str, f64, f64)]) {
    let signals: serde_json::Map<String, serde_json::Value> = rows
        .iter()
        .map(|(symbol, p_long, p_short)| {
            (
                symbol.to_string(),
                serde_json::json!([{
                    "ts": "2026-08-01T00:00:00Z",
                    "p_long": p_long,
                    "p_short": p_short,
                    "atr": 5.0,
                    "close": 100.0,
                }]),
            )
        })
        .collect();
    let artifact = serde_json::json!({
        "version": 1,
        "generated_at": "2026-08-01T00:05:00Z",
        "strategy_version": "wf-test",
        "params": {"sl_mult": 2.0, "tp_mult": 3.5},
        "signals": signals,
    });
    std::fs::write(dir.join("signals.json"), artifact.to_string()).unwrap();
}

fn build(dir: &Path, mode: ExecutionMode) -> Harness {
    let paper = sim();
    let live = sim();

    let paper_router = Arc::new(
        ExecutionRouter::new(HashMap::new(), "sim", Duration::from_secs(1))
            .with_broker(paper.clone()),
    );
    let live_router = Arc::new(
        ExecutionRouter::new(HashMap::new(), "sim", Duration::from_secs(1))
            .with_broker(live.clone()),
    );

    let ledger = Arc::new(TradeLedger::open(&dir.join("trades.sqlite")).unwrap());
    let protections = ProtectionsManager::load(dir.join("protections.json"));
    let switch = TestSwitch::default();

    let config = RunnerConfig {
        mode,
        profile: "wf-test".to_string(),
        signals_file: dir.join("signals.json"),
        risk_file: dir.join("risk.toml"),
        runner_state_file: dir.join("runner_state.json"),
        kill_switch_file: dir.join("kill_switch.json"),
        cycle_interval: Duration::from_millis(10),
        max_consecutive_errors: 5,
        stale_open_after: chrono::Duration::minutes(5),
        assets: None,
    };

    let runner = Runner::new(
        config,
        live_router,
        paper_router,
        Some(paper.clone()),
        ledger.clone(),
        protections,
        Box::new(switch.clone()),
        Heartbeat::new(dir.join("runner_heartbeat.json"), Duration::ZERO, mode.as_str()),
        Alerter::new(&AlertSettings::default()),
    );

    Harness { runner, paper, live, ledger, switch }
}

fn entry_key(symbol: &str, p_long: f64, p_short: f64) -> IntentKey {
    let symbol = Symbol(symbol.to_string());
    let signal_id = derive_signal_id(
        &symbol,
        "2026-08-01T00:00:00Z",
        "wf-test",
        &format!("{:.6}", p_long),
        &format!("{:.6}", p_short),
    );
    IntentKey::derive("sim", &symbol, IntentRole::Entry, &signal_id)
}

#[tokio::test]
async fn entry_fills_and_arms_protections() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path(), &[("BTCUSDT", 0.9, 0.05)]);

    let mut h = build(dir.path(), ExecutionMode::Paper);
    h.runner.initialize().await.unwrap();
    let outcome = h.runner.run(true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let positions = h.paper.positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    // equity 10k, confidence-scaled risk ~2.5%, stop distance 10 -> ~25
    // (the risk fraction goes through f64, so allow float dust).
    let qty = positions[0].quantity;
    assert!(qty > dec!(24.9) && qty <= dec!(25), "unexpected size {}", qty);

    // Protections armed synthetically (sim has no native stops).
    assert_eq!(h.runner.protections().len(), 1);
    let entry = h.runner.protections().get(&Symbol("BTCUSDT".to_string())).unwrap();
    assert_eq!(entry.stop_price, Some(dec!(90)));
    assert_eq!(entry.take_profit_price, Some(dec!(117.5)));

    let record = h.ledger.get(&entry_key("BTCUSDT", 0.9, 0.05)).unwrap().unwrap();
    assert_eq!(record.status, OrderStatus::Filled);
}

#[tokio::test]
async fn same_decision_is_never_executed_twice_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path(), &[("BTCUSDT", 0.9, 0.05)]);

    {
        let mut h = build(dir.path(), ExecutionMode::Paper);
        h.runner.initialize().await.unwrap();
        h.runner.run(true).await.unwrap();
        assert_eq!(h.paper.positions().await.unwrap().len(), 1);

        // The position disappears out-of-band (stop fired while down,
        // manual close, ...).
        h.paper.close_position(&Symbol("BTCUSDT".to_string())).await.unwrap();
    }

    // Simulate a crash that lost the runner's own bookkeeping — only the
    // ledger survives.
    std::fs::remove_file(dir.path().join("runner_state.json")).unwrap();

    let mut h = build(dir.path(), ExecutionMode::Paper);
    h.runner.initialize().await.unwrap();
    h.runner.run(true).await.unwrap();

    // The same signal decision is NOT re-executed: the ledger gate holds.
    assert!(h.paper.positions().await.unwrap().is_empty());
    let record = h.ledger.get(&entry_key("BTCUSDT", 0.9, 0.05)).unwrap().unwrap();
    assert_eq!(record.status, OrderStatus::Filled);
}

#[tokio::test]
async fn risk_limit_refusal_is_recorded_and_never_reaches_the_router() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path(), &[("BTCUSDT", 0.9, 0.05), ("ETHUSDT", 0.9, 0.05)]);
    std::fs::write(dir.path().join("risk.toml"), "max_open_positions = 1\n").unwrap();

    let mut h = build(dir.path(), ExecutionMode::Paper);
    h.runner.initialize().await.unwrap();
    h.runner.run(true).await.unwrap();

    // Alphabetical evaluation: BTCUSDT fills the single slot, ETHUSDT is
    // refused before any order is placed.
    let positions = h.paper.positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, Symbol("BTCUSDT".to_string()));

    let refused = h.ledger.get(&entry_key("ETHUSDT", 0.9, 0.05)).unwrap().unwrap();
    assert_eq!(refused.status, OrderStatus::Rejected);
    assert_eq!(refused.detail["reason"], serde_json::json!("RiskLimitExceeded"));
}

#[tokio::test]
async fn live_mode_without_arming_routes_to_the_simulated_path() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path(), &[("BTCUSDT", 0.9, 0.05)]);
    // mode = live, but the arming flag stays off.
    std::fs::write(dir.path().join("risk.toml"), "live_trading_armed = false\n").unwrap();

    let mut h = build(dir.path(), ExecutionMode::Live);
    h.runner.initialize().await.unwrap();
    h.runner.run(true).await.unwrap();

    // Every call landed on the paper venue; the live adapter saw nothing.
    assert_eq!(h.paper.positions().await.unwrap().len(), 1);
    assert!(h.live.positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn kill_switch_unwinds_to_flat_and_halts() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path(), &[("BTCUSDT", 0.9, 0.05), ("ETHUSDT", 0.85, 0.05)]);

    let mut h = build(dir.path(), ExecutionMode::Paper);
    h.runner.initialize().await.unwrap();
    h.runner.run(true).await.unwrap();
    assert_eq!(h.paper.positions().await.unwrap().len(), 2);
    assert_eq!(h.runner.protections().len(), 2);

    h.switch.enable("operator-stop");
    let outcome = h.runner.run(true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Halted { reason: "operator-stop".to_string() });

    // Zero open positions, empty synthetic-protection set.
    assert!(h.paper.positions().await.unwrap().is_empty());
    assert!(h.runner.protections().is_empty());
}

#[tokio::test]
async fn repeated_cycle_errors_trip_the_kill_switch_file() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path(), &[("BTCUSDT", 0.9, 0.05)]);
    // A corrupt risk file is a hard cycle error: risk limits must never
    // be silently defaulted when the file exists but cannot be parsed.
    std::fs::write(dir.path().join("risk.toml"), "max_open_positions = [broken").unwrap();

    let mut h = build(dir.path(), ExecutionMode::Paper);
    // Tighten the trip threshold for the test.
    let config = RunnerConfig {
        mode: ExecutionMode::Paper,
        profile: "wf-test".to_string(),
        signals_file: dir.path().join("signals.json"),
        risk_file: dir.path().join("risk.toml"),
        runner_state_file: dir.path().join("runner_state.json"),
        kill_switch_file: dir.path().join("kill_switch.json"),
        cycle_interval: Duration::from_millis(10),
        max_consecutive_errors: 1,
        stale_open_after: chrono::Duration::minutes(5),
        assets: None,
    };
    h.runner = Runner::new(
        config,
        Arc::new(ExecutionRouter::new(HashMap::new(), "sim", Duration::from_secs(1)).with_broker(h.paper.clone())),
        Arc::new(ExecutionRouter::new(HashMap::new(), "sim", Duration::from_secs(1)).with_broker(h.paper.clone())),
        Some(h.paper.clone()),
        h.ledger.clone(),
        ProtectionsManager::load(dir.path().join("protections.json")),
        Box::new(h.switch.clone()),
        Heartbeat::new(dir.path().join("runner_heartbeat.json"), Duration::ZERO, "paper"),
        Alerter::new(&AlertSettings::default()),
    );

    let outcome = h.runner.run(true).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Halted { .. }));

    // The auto-trip persisted an enabled switch so the halt survives a
    // process restart.
    let state: KillSwitchState =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("kill_switch.json")).unwrap())
            .unwrap();
    assert!(state.enabled);
    assert!(state.reason.contains("auto_max_consecutive_errors"));
}

#[tokio::test]
async fn exit_signal_flattens_and_drops_protections() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path(), &[("BTCUSDT", 0.9, 0.05)]);

    let mut h = build(dir.path(), ExecutionMode::Paper);
    h.runner.initialize().await.unwrap();
    h.runner.run(true).await.unwrap();
    assert_eq!(h.paper.positions().await.unwrap().len(), 1);

    // A fresh artifact flips to a short signal.
    let rows: &[(&str, f64, f64)] = &[("BTCUSDT", 0.05, 0.9)];
    write_artifact(dir.path(), rows);
    h.runner.run(true).await.unwrap();

    assert!(h.paper.positions().await.unwrap().is_empty());
    assert!(h.runner.protections().is_empty());

    let symbol = Symbol("BTCUSDT".to_string());
    let signal_id = derive_signal_id(&symbol, "2026-08-01T00:00:00Z", "wf-test", "0.050000", "0.900000");
    let exit_key = IntentKey::derive("sim", &symbol, IntentRole::Exit, &signal_id);
    assert_eq!(h.ledger.get(&exit_key).unwrap().unwrap().status, OrderStatus::Filled);
}
