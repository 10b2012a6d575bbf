// In crates/engine/src/signals.rs

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Strategy parameters shipped inside the artifact by the training
/// pipeline. The runner treats them as data, never as code.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyParams {
    #[serde(default = "default_sl_mult")]
    pub sl_mult: f64,
    #[serde(default = "default_tp_mult")]
    pub tp_mult: f64,
}

fn default_sl_mult() -> f64 {
    2.0
}

fn default_tp_mult() -> f64 {
    3.5
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            sl_mult: default_sl_mult(),
            tp_mult: default_tp_mult(),
        }
    }
}

/// One time-bucket of model output for one symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalRow {
    /// Bar timestamp, as written by the training pipeline (opaque here;
    /// it only has to be stable for signal-id derivation).
    pub ts: String,
    pub p_long: f64,
    pub p_short: f64,
    /// Average true range at the bar, used for stop distance and sizing.
    #[serde(default)]
    pub atr: f64,
    /// Bar close, used as the reference price.
    #[serde(default)]
    pub close: f64,
}

/// The versioned, symbol-indexed signal artifact. Read-only input,
/// re-read fresh each cycle so a new training run is picked up without a
/// restart.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalArtifact {
    pub version: u32,
    #[serde(default)]
    pub generated_at: String,
    pub strategy_version: String,
    #[serde(default)]
    pub params: StrategyParams,
    pub signals: HashMap<String, Vec<SignalRow>>,
}

impl SignalArtifact {
    /// Loads and parses the artifact. The caller treats failures as
    /// "skip this cycle", never as a crash.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read signal artifact {}", path.display()))?;
        let artifact: SignalArtifact = serde_json::from_str(&raw)
            .with_context(|| format!("malformed signal artifact {}", path.display()))?;
        Ok(artifact)
    }

    /// The most recent row for a symbol.
    pub fn latest(&self, symbol: &str) -> Option<&SignalRow> {
        self.signals.get(symbol).and_then(|rows| rows.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_artifact() {
        let raw = r#"{
            "version": 1,
            "strategy_version": "wf-2026-07",
            "signals": {
                "BTCUSDT": [
                    {"ts": "2026-08-01T00:00:00Z", "p_long": 0.7, "p_short": 0.1, "atr": 120.0, "close": 65000.0}
                ]
            }
        }"#;
        let artifact: SignalArtifact = serde_json::from_str(raw).unwrap();
        assert_eq!(artifact.version, 1);
        // Params fall back to the shipped defaults.
        assert!((artifact.params.sl_mult - 2.0).abs() < f64::EPSILON);
        let row = artifact.latest("BTCUSDT").unwrap();
        assert!((row.p_long - 0.7).abs() < f64::EPSILON);
        assert!(artifact.latest("ETHUSDT").is_none());
    }

    #[test]
    fn missing_file_is_an_error_not_a_panic() {
        let err = SignalArtifact::load(Path::new("/nonexistent/signals.json")).unwrap_err();
        assert!(err.to_string().contains("signal artifact"));
    }
}
