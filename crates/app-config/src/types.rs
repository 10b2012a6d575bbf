// In crates/app-config/src/types.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use core_types::ExecutionMode;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// The application's general settings.
    pub app: AppSettings,
    /// Order routing and execution-regime settings.
    pub execution: ExecutionSettings,
    /// Durable state file locations.
    #[serde(default)]
    pub state: StateSettings,
    /// Per-venue credentials and endpoints.
    #[serde(default)]
    pub brokers: BrokerSettings,
    /// Operator alerting (optional).
    #[serde(default)]
    pub alerts: AlertSettings,
    /// Signal artifact location.
    pub signals: SignalSettings,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppSettings {
    /// The environment the application is running in (e.g., "development", "production").
    pub environment: String,
    /// The log level for the application.
    pub log_level: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ExecutionSettings {
    /// The execution regime. `live` still requires the arming flag in the
    /// risk file before any real order leaves the process.
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Broker used for symbols absent from the routing table.
    pub default_broker: String,

    /// Static symbol -> broker-name routing table, resolved once per run.
    #[serde(default)]
    pub routing: HashMap<String, String>,

    /// Seconds a cycle waits for an order to reach a final status.
    #[serde(default = "default_confirm_timeout")]
    pub order_confirm_timeout_s: f64,

    /// Consecutive failed cycles before the runner trips the kill-switch
    /// itself.
    #[serde(default = "default_max_errors")]
    pub max_consecutive_errors: u32,

    /// Pending ledger reservations older than this are re-verified against
    /// the broker on startup.
    #[serde(default = "default_stale_pending")]
    pub stale_pending_after_s: u64,
}

fn default_confirm_timeout() -> f64 {
    30.0
}

fn default_max_errors() -> u32 {
    5
}

fn default_stale_pending() -> u64 {
    300
}

/// Locations of the durable runtime state. Everything lives under `dir`
/// unless individually overridden.
#[derive(Deserialize, Debug, Clone)]
pub struct StateSettings {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    pub ledger_file: Option<PathBuf>,
    pub protections_file: Option<PathBuf>,
    pub kill_switch_file: Option<PathBuf>,
    pub heartbeat_file: Option<PathBuf>,
    pub runner_state_file: Option<PathBuf>,
    pub risk_file: Option<PathBuf>,
    pub sim_state_file: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            ledger_file: None,
            protections_file: None,
            kill_switch_file: None,
            heartbeat_file: None,
            runner_state_file: None,
            risk_file: None,
            sim_state_file: None,
        }
    }
}

impl StateSettings {
    fn resolve(&self, explicit: &Option<PathBuf>, name: &str) -> PathBuf {
        explicit.clone().unwrap_or_else(|| self.dir.join(name))
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.resolve(&self.ledger_file, "trades.sqlite")
    }

    pub fn protections_file(&self) -> PathBuf {
        self.resolve(&self.protections_file, "protections.json")
    }

    pub fn kill_switch_file(&self) -> PathBuf {
        self.resolve(&self.kill_switch_file, "kill_switch.json")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.resolve(&self.heartbeat_file, "runner_heartbeat.json")
    }

    pub fn runner_state_file(&self) -> PathBuf {
        self.resolve(&self.runner_state_file, "runner_state.json")
    }

    pub fn risk_file(&self) -> PathBuf {
        self.resolve(&self.risk_file, "risk.toml")
    }

    pub fn sim_state_file(&self) -> PathBuf {
        self.resolve(&self.sim_state_file, "sim_state.json")
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct BrokerSettings {
    pub bitra: Option<BitraSettings>,
    pub equitex: Option<EquitexSettings>,
    #[serde(default)]
    pub simulated: SimulatedSettings,
}

/// Credentials for the crypto-futures venue.
#[derive(Deserialize, Debug, Clone)]
pub struct BitraSettings {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
    pub rest_base_url: String,
    /// REST requests per second budget for the token bucket.
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,
}

/// Credentials for the equities venue.
#[derive(Deserialize, Debug, Clone)]
pub struct EquitexSettings {
    pub token: String,
    pub rest_base_url: String,
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,
}

fn default_rate() -> f64 {
    5.0
}

#[derive(Deserialize, Debug, Clone)]
pub struct SimulatedSettings {
    #[serde(default = "default_starting_cash")]
    pub starting_cash: f64,
    /// The simulated slippage fraction for market orders (e.g., 0.001 for 0.1%).
    #[serde(default = "default_slippage")]
    pub slippage_percent: f64,
    /// The taker fee fraction for the simulated venue.
    #[serde(default = "default_taker_fee")]
    pub taker_fee: f64,
}

fn default_starting_cash() -> f64 {
    10_000.0
}

fn default_slippage() -> f64 {
    0.001
}

fn default_taker_fee() -> f64 {
    0.0004
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            starting_cash: default_starting_cash(),
            slippage_percent: default_slippage(),
            taker_fee: default_taker_fee(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct AlertSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SignalSettings {
    /// Path to the signal artifact produced by the training pipeline.
    pub file: PathBuf,
}

/// Hot-reloadable risk limits. The runner re-reads these every cycle so
/// operators can tighten risk without a restart.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RiskLimits {
    /// Maximum simultaneously open positions across all brokers. Zero
    /// disables the limit.
    #[serde(default)]
    pub max_open_positions: u32,

    /// Base fraction of equity risked per trade.
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Ceiling for the confidence-scaled per-trade risk fraction.
    #[serde(default = "default_max_risk")]
    pub max_risk_per_trade: f64,

    /// Minimum signal confidence before an entry is considered.
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f64,

    /// Maximum notional (quote currency) per position. Zero disables.
    #[serde(default)]
    pub max_position_notional: f64,

    /// Maximum intraday drawdown fraction per broker before new entries
    /// are refused. Zero disables.
    #[serde(default)]
    pub max_daily_drawdown: f64,

    /// The live-arming flag. While false, `live` mode downgrades to paper
    /// semantics every cycle.
    #[serde(default)]
    pub live_trading_armed: bool,
}

fn default_risk_per_trade() -> f64 {
    0.01
}

fn default_max_risk() -> f64 {
    0.03
}

fn default_confidence() -> f64 {
    0.6
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_open_positions: 0,
            risk_per_trade: default_risk_per_trade(),
            max_risk_per_trade: default_max_risk(),
            confidence_threshold: default_confidence(),
            max_position_notional: 0.0,
            max_daily_drawdown: 0.0,
            live_trading_armed: false,
        }
    }
}

impl ExecutionSettings {
    /// Resolves the routing table into `symbol -> broker name`, falling
    /// back to `default_broker` for unlisted symbols.
    pub fn broker_for(&self, symbol: &str) -> &str {
        self.routing
            .get(symbol)
            .map(String::as_str)
            .unwrap_or(&self.default_broker)
    }
}

impl StateSettings {
    /// Convenience used by tests and the status command.
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}
