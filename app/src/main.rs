// In app/src/main.rs

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use core_types::ExecutionMode;
use engine::alerts::Alerter;
use engine::heartbeat::{Heartbeat, HeartbeatRecord};
use engine::kill_switch::{FileKillSwitch, KillSwitchSource, KillSwitchState};
use engine::{RunOutcome, Runner, RunnerConfig};
use execution::bitra::BitraClient;
use execution::equitex::EquitexClient;
use execution::simulated::SimulatedBroker;
use ledger::TradeLedger;
use protections::ProtectionsManager;
use router::ExecutionRouter;
use tracing_subscriber::prelude::*;

// --- Command-Line Interface Definition ---

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = "Meridian: an automated trading fund execution runner.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the strategy runner against the configured brokers.
    Run {
        /// Execute exactly one cycle, then exit (default: loop forever).
        #[arg(long)]
        once: bool,

        /// Path to the signal artifact (overrides the configured path).
        #[arg(long)]
        signals: Option<PathBuf>,

        /// Seconds to sleep between cycles.
        #[arg(long, default_value_t = 10.0)]
        interval: f64,

        /// Comma-separated allowlist of symbols to evaluate (e.g.,
        /// "BTCUSDT,ETHUSDT"). Default: every symbol in the artifact.
        #[arg(long)]
        assets: Option<String>,
    },

    /// Prints runner liveness, kill-switch state and a ledger summary.
    Status,
}

// --- Main Application Entry Point ---

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a .env file, if it exists.
    dotenvy::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(
        tracing_subscriber::filter::Targets::new()
            .with_target("reqwest", tracing::Level::WARN)
            .with_target("hyper", tracing::Level::WARN)
            .with_default(tracing::Level::INFO),
    );
    tracing_subscriber::registry().with(fmt_layer).init();

    let cli = Cli::parse();

    tracing::info!("Starting Meridian application");

    match cli.command {
        Commands::Run { once, signals, interval, assets } => {
            run_app(once, signals, interval, assets).await?;
        }
        Commands::Status => {
            handle_status()?;
        }
    }

    tracing::info!("Meridian application has finished.");

    Ok(())
}

// --- "Run" Subcommand Logic ---

/// Initializes every core component and hands control to the runner.
async fn run_app(
    once: bool,
    signals_override: Option<PathBuf>,
    interval: f64,
    assets: Option<String>,
) -> Result<()> {
    // --- 1. Configuration ---
    let settings = app_config::load_settings()?;
    tracing::info!(mode = settings.execution.mode.as_str(), "Application settings loaded successfully.");

    let state = &settings.state;
    let confirm_timeout = Duration::from_secs_f64(settings.execution.order_confirm_timeout_s);

    // --- 2. Durable state ---
    let ledger = Arc::new(TradeLedger::open(&state.ledger_file())?);
    let protections = ProtectionsManager::load(state.protections_file());

    // --- 3. Brokers and routers ---
    // The simulated venue always exists: it is the paper path and the
    // target of the live-arm downgrade.
    let sim = Arc::new(SimulatedBroker::new(
        settings.brokers.simulated.clone(),
        Some(state.sim_state_file()),
    ));

    // The paper router ignores the routing table: every symbol lands on
    // the simulated adapter.
    let paper_router = Arc::new(
        ExecutionRouter::new(HashMap::new(), "sim", confirm_timeout).with_broker(sim.clone()),
    );

    let live_router = if settings.execution.mode == ExecutionMode::Live {
        tracing::warn!("LIVE mode configured. Real orders will be placed once the arming flag is on.");
        let mut router = ExecutionRouter::new(
            settings.execution.routing.clone(),
            settings.execution.default_broker.clone(),
            confirm_timeout,
        );
        if let Some(bitra) = &settings.brokers.bitra {
            router = router.with_broker(Arc::new(BitraClient::new(bitra)));
        }
        if let Some(equitex) = &settings.brokers.equitex {
            router = router.with_broker(Arc::new(EquitexClient::new(equitex)));
        }
        // Symbols explicitly routed to "sim" stay simulated even live.
        router = router.with_broker(sim.clone());
        Arc::new(router)
    } else {
        Arc::clone(&paper_router)
    };

    // --- 4. Runner ---
    let config = RunnerConfig {
        mode: settings.execution.mode,
        profile: "universal".to_string(),
        signals_file: signals_override.unwrap_or_else(|| settings.signals.file.clone()),
        risk_file: state.risk_file(),
        runner_state_file: state.runner_state_file(),
        kill_switch_file: state.kill_switch_file(),
        cycle_interval: Duration::from_secs_f64(interval),
        max_consecutive_errors: settings.execution.max_consecutive_errors,
        stale_open_after: chrono::Duration::seconds(settings.execution.stale_pending_after_s as i64),
        assets: assets.map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }),
    };

    let mut runner = Runner::new(
        config,
        live_router,
        paper_router,
        Some(sim),
        ledger,
        protections,
        Box::new(FileKillSwitch::new(state.kill_switch_file())),
        Heartbeat::new(state.heartbeat_file(), Duration::from_secs(5), settings.execution.mode.as_str()),
        Alerter::new(&settings.alerts),
    );

    runner.initialize().await?;

    match runner.run(once).await? {
        RunOutcome::Completed => {
            tracing::info!("One-shot cycle complete.");
        }
        RunOutcome::Halted { reason } => {
            tracing::error!(
                reason = %reason,
                "Runner HALTED by kill-switch. Clear the flag and restart the process to resume."
            );
        }
    }
    Ok(())
}

// --- "Status" Subcommand Logic ---

/// Prints the operator view: heartbeat freshness, kill-switch state and
/// the ledger's per-status record counts.
fn handle_status() -> Result<()> {
    let settings = app_config::load_settings()?;
    let state = &settings.state;

    let heartbeat: HeartbeatRecord = protections::store::read_json_or_default(&state.heartbeat_file());
    println!("--- Runner Heartbeat ---");
    if heartbeat.ts > 0.0 {
        let age = chrono::Utc::now().timestamp_millis() as f64 / 1000.0 - heartbeat.ts;
        println!(
            "  status={} cycle={} mode={} age={:.0}s pid={} note={}",
            heartbeat.status, heartbeat.cycle_count, heartbeat.mode, age, heartbeat.pid, heartbeat.note
        );
    } else {
        println!("  (no heartbeat file)");
    }

    let switch: KillSwitchState = FileKillSwitch::new(state.kill_switch_file()).read();
    println!("--- Kill-Switch ---");
    if switch.enabled {
        println!("  ENABLED: {}", switch.reason);
    } else {
        println!("  disabled");
    }

    let ledger = TradeLedger::open(&state.ledger_file())?;
    println!("--- Ledger ---");
    let summary = ledger.status_summary()?;
    if summary.is_empty() {
        println!("  (empty)");
    }
    for (status, count) in summary {
        println!("  {:>10}: {}", status, count);
    }

    Ok(())
}
