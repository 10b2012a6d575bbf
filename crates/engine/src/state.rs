// In crates/engine/src/state.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Durable runner bookkeeping: which signal decision was last acted on
/// per symbol, so one signal row produces at most one evaluation even
/// across restarts. The ledger is the hard idempotency gate; this file
/// just avoids re-deriving and re-refusing the same intents every cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerState {
    #[serde(default)]
    pub last_seen: HashMap<String, String>,
}

impl RunnerState {
    pub fn load(path: &Path) -> Self {
        protections::store::read_json_or_default(path)
    }

    pub fn persist(&self, path: &PathBuf) -> std::io::Result<()> {
        protections::store::atomic_write_json(path, self)
    }

    /// True when this exact signal decision was already processed.
    pub fn already_seen(&self, symbol: &str, signal_id: &str) -> bool {
        self.last_seen.get(symbol).is_some_and(|seen| seen == signal_id)
    }

    pub fn mark_seen(&mut self, symbol: &str, signal_id: &str) {
        self.last_seen.insert(symbol.to_string(), signal_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_markers_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner_state.json");

        let mut state = RunnerState::load(&path);
        assert!(!state.already_seen("BTCUSDT", "sig-1"));
        state.mark_seen("BTCUSDT", "sig-1");
        state.persist(&path).unwrap();

        let reloaded = RunnerState::load(&path);
        assert!(reloaded.already_seen("BTCUSDT", "sig-1"));
        assert!(!reloaded.already_seen("BTCUSDT", "sig-2"));
    }
}
